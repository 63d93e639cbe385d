
use gemini_web::constants::Endpoint;
use gemini_web::rpc::decode_envelope;
use gemini_web::GeminiError;
use serde_json::json;
use std::sync::Arc;
use test_utils::{batch_reply, client_with, landing_page, quiet_config, MockResponse, MockTransport};

fn system_gems() -> String {
    json!([null, null, [["sys-1", ["Brainstormer", "Ideas"], ["Be creative."]]]]).to_string()
}

fn custom_gems() -> String {
    json!([null, null, [["mine-1", ["Reviewer", ""], ["Review code."]]]]).to_string()
}

fn gem_transport() -> Arc<MockTransport> {
    let transport = MockTransport::new();
    let (system, custom) = (system_gems(), custom_gems());
    let reply = batch_reply(&[("system", system.as_str()), ("custom", custom.as_str())]);
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::BatchExecute, MockResponse::ok(reply));
    transport
}

#[test]
fn fetch_merges_system_and_custom_gems() {
    let transport = gem_transport();
    let client = client_with(Arc::clone(&transport), quiet_config());

    let jar = client.fetch_gems(false).unwrap();
    assert_eq!(jar.len(), 2);
    assert!(jar.get("sys-1").unwrap().predefined);
    let mine = jar.get("mine-1").unwrap();
    assert!(!mine.predefined);
    assert_eq!(mine.name, "Reviewer");
    assert!(mine.description.is_none());
    assert_eq!(mine.prompt.as_deref(), Some("Review code."));
    assert_eq!(client.gems(), Some(jar));

    let request = transport.requests_to(Endpoint::BatchExecute).pop().unwrap();
    assert!(request.url.contains("rpcids=CNgdBe%2CCNgdBe"));
    let calls = decode_envelope(request.body.form_field("f.req").unwrap()).unwrap();
    assert_eq!(calls[0].payload, "[3]");
    assert_eq!(calls[1].payload, "[2]");
}

#[test]
fn hidden_gems_use_the_wider_list() {
    let transport = gem_transport();
    let client = client_with(Arc::clone(&transport), quiet_config());

    client.fetch_gems(true).unwrap();
    let request = transport.requests_to(Endpoint::BatchExecute).pop().unwrap();
    let calls = decode_envelope(request.body.form_field("f.req").unwrap()).unwrap();
    assert_eq!(calls[0].payload, "[4]");
}

#[test]
fn create_adds_to_cache() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(
            Endpoint::BatchExecute,
            MockResponse::ok(batch_reply(&[("generic", r#"["new-gem"]"#)])),
        );
    let client = client_with(Arc::clone(&transport), quiet_config());

    let gem = client
        .create_gem("Tester", "Write tests.", Some("Testing helper"))
        .unwrap();
    assert_eq!(gem.id, "new-gem");
    assert_eq!(gem.description.as_deref(), Some("Testing helper"));
    assert_eq!(client.get_gem("new-gem"), Some(gem));

    let request = transport.requests_to(Endpoint::BatchExecute).pop().unwrap();
    let calls = decode_envelope(request.body.form_field("f.req").unwrap()).unwrap();
    assert_eq!(calls[0].method_id, "oMH3Zd");
    assert_eq!(
        calls[0].payload,
        r#"[["Tester","Testing helper","Write tests.",null,null,null,null,null,0,null,1,null,null,null,[]]]"#
    );
}

#[test]
fn failed_create_leaves_cache_alone() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::BatchExecute, MockResponse::new(500, "nope"));
    let client = client_with(Arc::clone(&transport), quiet_config());

    assert!(client.create_gem("Tester", "p", None).is_err());
    assert!(client.gems().is_none());
}

#[test]
fn update_and_delete_custom_gem() {
    let transport = gem_transport();
    transport.on(
        Endpoint::BatchExecute,
        MockResponse::ok(batch_reply(&[("generic", "[]")])),
    );
    let client = client_with(Arc::clone(&transport), quiet_config());
    client.fetch_gems(false).unwrap();

    let updated = client
        .update_gem("mine-1", "Strict reviewer", "Be strict.", None)
        .unwrap();
    assert_eq!(client.get_gem("mine-1"), Some(updated));

    let request = transport.requests_to(Endpoint::BatchExecute).pop().unwrap();
    let calls = decode_envelope(request.body.form_field("f.req").unwrap()).unwrap();
    assert_eq!(calls[0].method_id, "kHv0Vd");
    assert!(calls[0].payload.starts_with(r#"["mine-1",["Strict reviewer","","Be strict.""#));
    assert!(calls[0].payload.ends_with("[],0]]"));

    client.delete_gem("mine-1").unwrap();
    assert!(client.get_gem("mine-1").is_none());
    let request = transport.requests_to(Endpoint::BatchExecute).pop().unwrap();
    let calls = decode_envelope(request.body.form_field("f.req").unwrap()).unwrap();
    assert_eq!(calls[0].method_id, "UXcSJb");
    assert_eq!(calls[0].payload, r#"["mine-1"]"#);
}

#[test]
fn predefined_gems_are_read_only() {
    let transport = gem_transport();
    let client = client_with(Arc::clone(&transport), quiet_config());
    client.fetch_gems(false).unwrap();
    let before = transport.count(Endpoint::BatchExecute);

    assert!(matches!(
        client.update_gem("sys-1", "x", "y", None),
        Err(GeminiError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.delete_gem("sys-1"),
        Err(GeminiError::InvalidArgument(_))
    ));
    assert_eq!(transport.count(Endpoint::BatchExecute), before);
    assert!(client.get_gem("sys-1").is_some());
}

#[test]
fn close_drops_the_gem_cache() {
    let transport = gem_transport();
    let client = client_with(Arc::clone(&transport), quiet_config());
    client.fetch_gems(false).unwrap();
    assert!(client.gems().is_some());

    client.close();
    assert!(client.gems().is_none());
    assert!(client.get_gem("mine-1").is_none());
}
