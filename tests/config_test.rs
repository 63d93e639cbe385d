
use gemini_web::constants::{Endpoint, SESSION_ID_COOKIE};
use gemini_web::{Client, ClientConfig, CookieFile, Model};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_utils::{landing_page, quiet_config, rotation_reply, MockResponse, MockTransport};

#[test]
fn cookie_cache_loads_and_persists_rotations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("cookies.json");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        r#"{"__Secure-1PSID":"sid-file","__Secure-1PSIDTS":"ts-file"}"#,
    )
    .unwrap();
    let cache = CookieFile::new(&path);

    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::RotateCookies, rotation_reply("ts-rotated"));
    let client = Client::builder()
        .config(
            quiet_config()
                .with_auto_refresh(true)
                .with_refresh_interval(Duration::from_millis(20)),
        )
        .transport(transport.clone())
        .cookie_loader(Arc::new(cache.clone()))
        .persistence(cache.persistence_callback())
        .build()
        .unwrap();
    client.init().unwrap();
    assert_eq!(
        transport.requests_to(Endpoint::Init)[0].cookie(SESSION_ID_COOKIE),
        Some("sid-file")
    );

    std::thread::sleep(Duration::from_millis(300));
    client.close();
    let reloaded = cache.read().unwrap();
    assert_eq!(reloaded.session_id(), "sid-file");
    assert_eq!(reloaded.rotation_token(), Some("ts-rotated"));
}

#[test]
fn missing_cookie_file_fails_init() {
    let dir = TempDir::new().unwrap();
    let cache = CookieFile::new(dir.path().join("absent.json"));
    assert!(!cache.exists());

    let client = Client::builder()
        .config(quiet_config())
        .transport(MockTransport::new())
        .cookie_loader(Arc::new(cache))
        .build()
        .unwrap();
    assert!(client.init().is_err());
    assert!(!client.is_running());
}

#[test]
fn builder_config_flows_through() {
    let config = ClientConfig::default()
        .with_auto_close(Duration::from_secs(30))
        .with_model(Model::G2_5Flash)
        .with_browser("firefox");
    let client = Client::builder()
        .config(config)
        .transport(MockTransport::new())
        .build()
        .unwrap();

    assert!(client.config().auto_close);
    assert_eq!(client.config().close_delay, Duration::from_secs(30));
    assert_eq!(client.model(), Model::G2_5Flash);
    client.set_model(Model::G2_5Pro);
    assert_eq!(client.model(), Model::G2_5Pro);
}
