
use gemini_web::constants::{Endpoint, SESSION_ID_COOKIE};
use gemini_web::{
    BrowserCookieExtractor, CancelToken, Client, CookieLoader, Credentials, GeminiError,
    GenerateOptions, Phase, RpcCall,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_utils::{
    batch_reply, client_with, credentials, generate_reply, landing_page, quiet_config,
    MockResponse, MockTransport,
};

fn counting_extractor(calls: Arc<AtomicUsize>) -> Arc<dyn BrowserCookieExtractor> {
    Arc::new(move |_cancel: &CancelToken, browser: &str| {
        assert_eq!(browser, "chrome");
        calls.fetch_add(1, Ordering::SeqCst);
        Credentials::new("sid-browser", Some("ts-browser".to_string()))
    })
}

#[test]
fn init_fetches_access_token() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok-1")));
    let client = client_with(Arc::clone(&transport), quiet_config());

    assert_eq!(client.phase(), Phase::Fresh);
    client.init().unwrap();
    assert!(client.is_running());
    assert_eq!(client.access_token().as_deref(), Some("tok-1"));

    let init = transport.requests_to(Endpoint::Init);
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].cookie(SESSION_ID_COOKIE), Some("sid-test"));
}

#[test]
fn init_twice_fetches_once() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let client = client_with(Arc::clone(&transport), quiet_config());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.init())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(transport.count(Endpoint::Init), 1);
}

#[test]
fn missing_token_is_auth_error() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok("<html>signed out</html>"));
    let client = client_with(Arc::clone(&transport), quiet_config());

    let err = client.init().unwrap_err();
    assert!(err.is_auth());
    assert_eq!(client.phase(), Phase::Fresh);
}

#[test]
fn close_is_idempotent() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let client = client_with(Arc::clone(&transport), quiet_config().with_auto_refresh(true));
    client.init().unwrap();
    assert!(client.is_rotating());

    for _ in 0..3 {
        client.close();
    }
    assert_eq!(client.phase(), Phase::Closed);
    assert!(!client.is_rotating());
    assert!(client.access_token().is_none());
}

#[test]
fn closed_client_reinitialises_on_use() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    transport.on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "hi")));
    let client = client_with(Arc::clone(&transport), quiet_config());
    client.init().unwrap();
    client.close();

    let output = client.generate("hello", GenerateOptions::new()).unwrap();
    assert_eq!(output.text(), "hi");
    assert!(client.is_running());
    assert_eq!(transport.count(Endpoint::Init), 2);
}

#[test]
fn closed_client_without_reinit_refuses() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let client = client_with(Arc::clone(&transport), quiet_config().with_auto_reinit(false));
    client.init().unwrap();
    client.close();

    let err = client.generate("hello", GenerateOptions::new()).unwrap_err();
    assert!(matches!(err, GeminiError::AutoReinitDisabled));
    assert!(matches!(client.init(), Err(GeminiError::AutoReinitDisabled)));
    assert_eq!(transport.count(Endpoint::Generate), 0);
}

#[test]
fn fresh_client_without_reinit_is_closed() {
    let transport = MockTransport::new();
    let client = client_with(Arc::clone(&transport), quiet_config().with_auto_reinit(false));

    let err = client.generate("hello", GenerateOptions::new()).unwrap_err();
    assert!(matches!(err, GeminiError::ClientClosed));
    assert!(transport.requests().is_empty());
}

#[test]
fn empty_prompt_is_rejected_before_io() {
    let transport = MockTransport::new();
    let client = client_with(Arc::clone(&transport), quiet_config());

    let err = client.generate("", GenerateOptions::new()).unwrap_err();
    assert!(matches!(err, GeminiError::InvalidArgument(_)));
    assert!(transport.requests().is_empty());
}

#[test]
fn idle_client_closes_itself() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let client = client_with(
        Arc::clone(&transport),
        quiet_config().with_auto_close(Duration::from_millis(50)),
    );
    client.init().unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(client.phase(), Phase::Closed);
}

#[test]
fn loader_supplies_missing_credentials() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let loader: Arc<dyn CookieLoader> = Arc::new(|| Credentials::new("sid-loaded", None));
    let client = Client::builder()
        .config(quiet_config())
        .transport(transport.clone())
        .cookie_loader(loader)
        .build()
        .unwrap();

    client.init().unwrap();
    assert_eq!(
        client.credentials().map(|c| c.session_id().to_string()).as_deref(),
        Some("sid-loaded")
    );
}

#[test]
fn loader_failure_falls_back_to_browser() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let extracted = Arc::new(AtomicUsize::new(0));
    let loader: Arc<dyn CookieLoader> = Arc::new(|| -> gemini_web::Result<Credentials> {
        Err(GeminiError::Auth("no cookie file".to_string()))
    });
    let client = Client::builder()
        .config(quiet_config())
        .transport(transport.clone())
        .cookie_loader(loader)
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();

    client.init().unwrap();
    assert_eq!(extracted.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport.requests_to(Endpoint::Init)[0].cookie(SESSION_ID_COOKIE),
        Some("sid-browser")
    );
}

#[test]
fn expired_cookies_are_replaced_from_browser_at_init() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok("<html>signed out</html>"))
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok-fresh")));
    let extracted = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .config(quiet_config())
        .transport(transport.clone())
        .credentials(credentials())
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();

    client.init().unwrap();
    assert_eq!(client.access_token().as_deref(), Some("tok-fresh"));
    let init = transport.requests_to(Endpoint::Init);
    assert_eq!(init.len(), 2);
    assert_eq!(init[1].cookie(SESSION_ID_COOKIE), Some("sid-browser"));
}

#[test]
fn unauthorised_generate_retries_once_after_browser_refresh() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::new(401, "expired"))
        .on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "Hi!")));
    let extracted = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .config(quiet_config().with_browser("chrome"))
        .transport(transport.clone())
        .credentials(credentials())
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();

    let output = client.generate("Hello, Gemini!", GenerateOptions::new()).unwrap();
    assert_eq!(output.text(), "Hi!");
    assert_eq!(transport.count(Endpoint::Generate), 2);
    assert_eq!(extracted.load(Ordering::SeqCst), 1);

    let retried = &transport.requests_to(Endpoint::Generate)[1];
    assert_eq!(retried.cookie(SESSION_ID_COOKIE), Some("sid-browser"));
}

#[test]
fn unauthorised_generate_without_browser_is_returned() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::new(401, "expired"));
    let client = client_with(Arc::clone(&transport), quiet_config());

    let err = client.generate("hello", GenerateOptions::new()).unwrap_err();
    assert!(err.is_auth());
    assert_eq!(transport.count(Endpoint::Generate), 1);
}

#[test]
fn server_errors_are_not_retried() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::new(500, "boom"));
    let extracted = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .config(quiet_config().with_browser("chrome"))
        .transport(transport.clone())
        .credentials(credentials())
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();

    match client.generate("hello", GenerateOptions::new()).unwrap_err() {
        GeminiError::Api {
            status, excerpt, ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(excerpt, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.count(Endpoint::Generate), 1);
    assert_eq!(extracted.load(Ordering::SeqCst), 0);
}

#[test]
fn browser_refresh_is_rate_limited() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let extracted = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .config(quiet_config().with_browser("chrome"))
        .transport(transport.clone())
        .credentials(credentials())
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();

    client.refresh_from_browser().unwrap();
    match client.refresh_from_browser().unwrap_err() {
        GeminiError::RefreshTooSoon { wait } => assert!(wait <= Duration::from_secs(60)),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(extracted.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_generate_issues_no_request() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let client = client_with(Arc::clone(&transport), quiet_config());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = client
        .generate("hello", GenerateOptions::new().with_cancel(cancel))
        .unwrap_err();
    assert!(matches!(err, GeminiError::Cancelled));
    assert_eq!(transport.count(Endpoint::Generate), 0);
}

#[test]
fn idle_expiry_between_calls_never_surfaces_as_closed() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "hi")))
        .on(Endpoint::BatchExecute, MockResponse::ok(batch_reply(&[("generic", "[]")])));
    let client = client_with(
        Arc::clone(&transport),
        quiet_config().with_auto_close(Duration::ZERO),
    );

    for _ in 0..200 {
        let output = client.generate("hello", GenerateOptions::new()).unwrap();
        assert_eq!(output.text(), "hi");
    }
    for _ in 0..50 {
        client.batch_execute(&[RpcCall::new("CNgdBe", "[]")]).unwrap();
    }
    assert_eq!(transport.count(Endpoint::Generate), 200);
    assert_eq!(transport.count(Endpoint::BatchExecute), 50);
}

#[test]
fn concurrent_close_never_surfaces_as_closed() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "hi")));
    let client = client_with(Arc::clone(&transport), quiet_config());
    client.init().unwrap();

    let closer = {
        let client = client.clone();
        thread::spawn(move || {
            for _ in 0..100 {
                client.close();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    for _ in 0..100 {
        client.generate("hello", GenerateOptions::new()).unwrap();
    }
    closer.join().unwrap();
}

#[test]
fn activity_postpones_idle_close() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok")))
        .on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "hi")));
    let client = client_with(
        Arc::clone(&transport),
        quiet_config().with_auto_close(Duration::from_millis(150)),
    );
    client.init().unwrap();

    for _ in 0..5 {
        thread::sleep(Duration::from_millis(80));
        client.generate("hello", GenerateOptions::new()).unwrap();
        assert_eq!(client.phase(), Phase::Running);
    }
    assert_eq!(transport.count(Endpoint::Init), 1);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(client.phase(), Phase::Closed);
}

#[test]
fn idle_closed_client_reinitialises_on_use() {
    let transport = MockTransport::new();
    transport
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok-1")))
        .on(Endpoint::Init, MockResponse::ok(landing_page("tok-2")))
        .on(Endpoint::Generate, MockResponse::ok(generate_reply("c", "r", "rc", "hi")));
    let client = client_with(
        Arc::clone(&transport),
        quiet_config().with_auto_close(Duration::from_millis(50)),
    );
    client.init().unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(client.phase(), Phase::Closed);

    client.generate("hello", GenerateOptions::new()).unwrap();
    assert_eq!(transport.count(Endpoint::Init), 2);
    let sent = transport.requests_to(Endpoint::Generate).pop().unwrap();
    assert_eq!(sent.body.form_field("at"), Some("tok-2"));
}

#[test]
fn closed_client_without_reinit_refuses_browser_refresh() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let extracted = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .config(quiet_config().with_auto_reinit(false).with_browser("chrome"))
        .transport(transport.clone())
        .credentials(credentials())
        .browser_extractor(counting_extractor(Arc::clone(&extracted)))
        .build()
        .unwrap();
    client.init().unwrap();
    client.close();

    assert!(matches!(
        client.refresh_from_browser(),
        Err(GeminiError::AutoReinitDisabled)
    ));
    assert_eq!(client.phase(), Phase::Closed);
    assert!(client.access_token().is_none());
    assert_eq!(transport.count(Endpoint::Init), 1);
    assert_eq!(extracted.load(Ordering::SeqCst), 0);
}

#[test]
fn caller_cancel_token_reaches_the_browser_extractor() {
    let transport = MockTransport::new();
    transport.on(Endpoint::Init, MockResponse::ok(landing_page("tok")));
    let loader: Arc<dyn CookieLoader> = Arc::new(|| -> gemini_web::Result<Credentials> {
        Err(GeminiError::Auth("no cookie file".to_string()))
    });
    let extractor: Arc<dyn BrowserCookieExtractor> =
        Arc::new(|cancel: &CancelToken, _browser: &str| {
            cancel.cancel();
            Credentials::new("sid-browser", None)
        });
    let client = Client::builder()
        .config(quiet_config())
        .transport(transport.clone())
        .cookie_loader(loader)
        .browser_extractor(extractor)
        .build()
        .unwrap();
    let cancel = CancelToken::new();

    let err = client
        .generate("hello", GenerateOptions::new().with_cancel(cancel.clone()))
        .unwrap_err();
    assert!(cancel.is_cancelled());
    assert!(matches!(err, GeminiError::Cancelled));
    assert_eq!(transport.count(Endpoint::Generate), 0);
}
