use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use esi_stream::{
    transform_string, Configuration, EsiStream, ExecutionError, FragmentDispatcher,
    FragmentRequest, FragmentResponse, Variables,
};
use http::{HeaderMap, StatusCode};
use log::debug;
use url::Url;

static INIT: Once = Once::new();

pub fn init_logs() {
    INIT.call_once(|| {
        // Read RUST_LOG if set; otherwise default to quiet globally, debug for *this* crate.
        let default = format!("warn,{}=debug", env!("CARGO_CRATE_NAME"));
        env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &default))
            .is_test(true)
            .init();
    });
}

fn base_url() -> Url {
    Url::parse("http://www.example.com/").unwrap()
}

/// Scripted fragment dispatcher: path → (status, body). Unknown paths 404.
fn dispatcher(routes: &[(&str, u16, &str)]) -> Arc<FragmentDispatcher> {
    let routes: HashMap<String, (u16, String)> = routes
        .iter()
        .map(|(path, status, body)| ((*path).to_owned(), (*status, (*body).to_owned())))
        .collect();
    Arc::new(move |request: FragmentRequest| {
        let found = routes.get(request.url.path()).cloned();
        Box::pin(async move {
            match found {
                Some((status, body)) => Ok(FragmentResponse::new(
                    StatusCode::from_u16(status).expect("scripted status"),
                )
                .with_body(body)),
                None => Ok(FragmentResponse::new(StatusCode::NOT_FOUND)),
            }
        })
    })
}

async fn process(input: &str, config: Configuration) -> esi_stream::Result<String> {
    init_logs();
    debug!("processing ESI document: {input:?}");
    transform_string(base_url(), HeaderMap::new(), config, input.as_bytes().to_vec()).await
}

struct MapVars(HashMap<String, String>);

impl MapVars {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
    }
}

impl Variables for MapVars {
    fn get_value(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
    fn get_sub_value(&self, name: &str, key: &str) -> Option<String> {
        self.0.get(&format!("{name}{{{key}}}")).cloned()
    }
}

// S1: a successful include is replaced by the fragment body.
#[tokio::test]
async fn include_success() {
    let config = Configuration::default().with_fetch(dispatcher(&[("/bar", 200, "bar")]));
    let result = process(r#"foo<esi:include src="/bar"/>baz"#, config)
        .await
        .unwrap();
    assert_eq!(result, "foobarbaz");
}

// S2: a failing include without onerror fails the stream.
#[tokio::test]
async fn include_failure_without_onerror() {
    let config = Configuration::default().with_fetch(dispatcher(&[]));
    let err = process(r#"a<esi:include src="/x"/>b"#, config)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::IncludeError { src } if src == "/x"));
}

// S3: onerror="continue" swallows the failure.
#[tokio::test]
async fn include_failure_with_onerror_continue() {
    let config = Configuration::default().with_fetch(dispatcher(&[]));
    let result = process(r#"a<esi:include src="/x" onerror="continue"/>b"#, config)
        .await
        .unwrap();
    assert_eq!(result, "ab");
}

// S4: choose selects the first true when branch.
#[tokio::test]
async fn choose_selects_first_true_when() {
    let config =
        Configuration::default().with_vars(Arc::new(MapVars::new(&[("FOO", "'foo'")])));
    let input = concat!(
        r#"<esi:choose>"#,
        r#"<esi:when test="$(FOO)=='bar'">R1</esi:when>"#,
        r#"<esi:when test="$(FOO)=='foo'">R2</esi:when>"#,
        r#"<esi:otherwise>R3</esi:otherwise>"#,
        r#"</esi:choose>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "R2");
}

#[tokio::test]
async fn choose_falls_back_to_otherwise() {
    let config =
        Configuration::default().with_vars(Arc::new(MapVars::new(&[("FOO", "'nope'")])));
    let input = concat!(
        r#"<esi:choose>"#,
        r#"<esi:when test="$(FOO)=='bar'">R1</esi:when>"#,
        r#"<esi:otherwise>R3</esi:otherwise>"#,
        r#"</esi:choose>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "R3");
}

// A when test with mismatched parentheses is simply false.
#[tokio::test]
async fn broken_test_expression_is_false() {
    let input = concat!(
        r#"<esi:choose>"#,
        r#"<esi:when test="('x' == 'x'">R1</esi:when>"#,
        r#"<esi:otherwise>R2</esi:otherwise>"#,
        r#"</esi:choose>"#
    );
    let result = process(input, Configuration::default()).await.unwrap();
    assert_eq!(result, "R2");
}

// S5: substitution applies inside esi:vars only.
#[tokio::test]
async fn vars_scope() {
    let config = Configuration::default().with_vars(Arc::new(MapVars::new(&[("FOO", "'Foo'")])));
    let result = process("a$(FOO)<esi:vars>a$(FOO)</esi:vars>", config)
        .await
        .unwrap();
    assert_eq!(result, "a$(FOO)aFoo");
}

// S6: ESI comment markers are stripped across chunk boundaries.
#[tokio::test]
async fn esi_comment_stripping_across_chunks() {
    init_logs();
    let (mut stream, mut output) =
        EsiStream::new(base_url(), HeaderMap::new(), Configuration::default()).unwrap();

    let collector = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(chunk) = output.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    });

    stream.write(b"<!--esi yo").await.unwrap();
    stream.write(b" ho -->bar").await.unwrap();
    stream.finish().await.unwrap();

    assert_eq!(collector.await.unwrap(), " yo ho bar");
}

// S7: a custom prefix matches; the default prefix then passes through.
#[tokio::test]
async fn custom_prefix() {
    let config = Configuration::default()
        .with_prefix("my-esi")
        .with_fetch(dispatcher(&[("/bar", 200, "bar")]));
    let result = process(r#"<my-esi:include src="/bar"/>"#, config)
        .await
        .unwrap();
    assert_eq!(result, "bar");

    let config = Configuration::default()
        .with_prefix("my-esi")
        .with_fetch(dispatcher(&[("/bar", 200, "bar")]));
    let result = process(r#"<esi:include src="/bar" />"#, config)
        .await
        .unwrap();
    assert_eq!(result, r#"<esi:include src="/bar" />"#);
}

#[tokio::test]
async fn invalid_prefix_fails_at_construction() {
    let config = Configuration::default().with_prefix("1-bad");
    let err = EsiStream::new(base_url(), HeaderMap::new(), config).unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidPrefix(p) if p == "1-bad"));
}

#[tokio::test]
async fn disabled_prefix_passes_directives_through() {
    let config = Configuration::default().without_prefix();
    let result = process(r#"a<esi:include src="/bar" />b"#, config)
        .await
        .unwrap();
    assert_eq!(result, r#"a<esi:include src="/bar" />b"#);
}

// Property 5: included bodies appear in source order.
#[tokio::test]
async fn include_ordering() {
    let config = Configuration::default().with_fetch(dispatcher(&[
        ("/one", 200, "1"),
        ("/two", 200, "2"),
        ("/three", 200, "3"),
    ]));
    let input = concat!(
        r#"a<esi:include src="/one"/>"#,
        r#"b<esi:include src="/two"/>"#,
        r#"c<esi:include src="/three"/>d"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "a1b2c3d");
}

#[tokio::test]
async fn include_alt_is_used_when_src_fails() {
    let config = Configuration::default().with_fetch(dispatcher(&[("/fallback", 200, "alt!")]));
    let result = process(r#"<esi:include src="/missing" alt="/fallback"/>"#, config)
        .await
        .unwrap();
    assert_eq!(result, "alt!");
}

#[tokio::test]
async fn include_src_interpolates_variables() {
    let requested = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requested);
    let fetch: Arc<FragmentDispatcher> = Arc::new(move |request: FragmentRequest| {
        log.lock().unwrap().push(request.url.to_string());
        Box::pin(async move {
            Ok(FragmentResponse::new(StatusCode::OK).with_body("fragment"))
        })
    });
    let config = Configuration::default().with_fetch(fetch);

    let url = Url::parse("http://www.example.com/?apiKey=value").unwrap();
    let result = transform_string(
        url,
        HeaderMap::new(),
        config,
        r#"<esi:include src="/v1/product?apiKey=$(QUERY_STRING{apiKey})" />"#,
    )
    .await
    .unwrap();
    assert_eq!(result, "fragment");
    assert_eq!(
        requested.lock().unwrap().as_slice(),
        ["http://www.example.com/v1/product?apiKey=value"]
    );
}

// Fragments from another host carry that host in the host header.
#[tokio::test]
async fn include_overrides_host_header_for_foreign_hosts() {
    let hosts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&hosts);
    let fetch: Arc<FragmentDispatcher> = Arc::new(move |request: FragmentRequest| {
        let host = request
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        seen.lock().unwrap().push(host);
        Box::pin(async move { Ok(FragmentResponse::new(StatusCode::OK).with_body("x")) })
    });

    let mut headers = HeaderMap::new();
    headers.insert(http::header::HOST, "www.example.com".parse().unwrap());
    let config = Configuration::default().with_fetch(fetch);
    let input = concat!(
        r#"<esi:include src="/local"/>"#,
        r#"<esi:include src="http://other.example.net:8080/remote"/>"#
    );
    transform_string(base_url(), headers, config, input)
        .await
        .unwrap();

    let seen = hosts.lock().unwrap();
    // Same-host include keeps the original header; foreign host overrides.
    assert_eq!(seen.as_slice(), ["www.example.com", "other.example.net:8080"]);
}

// Included fragments are themselves processed as ESI, inner-first.
#[tokio::test]
async fn includes_are_recursive() {
    let config = Configuration::default().with_fetch(dispatcher(&[
        ("/outer", 200, r#"[<esi:include src="/inner"/>]"#),
        ("/inner", 200, "core"),
    ]));
    let result = process(r#"a<esi:include src="/outer"/>b"#, config)
        .await
        .unwrap();
    assert_eq!(result, "a[core]b");
}

// Relative includes inside a fragment resolve against the fragment URL.
#[tokio::test]
async fn nested_includes_resolve_against_fragment_url() {
    let config = Configuration::default().with_fetch(dispatcher(&[
        ("/sub/outer", 200, r#"<esi:include src="inner"/>"#),
        ("/sub/inner", 200, "deep"),
    ]));
    let result = process(r#"<esi:include src="/sub/outer"/>"#, config)
        .await
        .unwrap();
    assert_eq!(result, "deep");
}

#[tokio::test]
async fn process_include_response_overrides_recursion() {
    let config = Configuration::default()
        .with_fetch(dispatcher(&[("/frag", 200, "<esi:ignored/>")]))
        .with_include_response_processor(Arc::new(|ctx| {
            Box::pin(async move {
                let body = ctx.response.text()?;
                Ok(format!("[{body}]"))
            })
        }));
    let result = process(r#"<esi:include src="/frag"/>"#, config)
        .await
        .unwrap();
    assert_eq!(result, "[<esi:ignored/>]");
}

#[tokio::test]
async fn include_error_handler_supplies_replacement() {
    let config = Configuration::default()
        .with_fetch(dispatcher(&[]))
        .with_include_error_handler(Arc::new(|ctx: &esi_stream::IncludeErrorContext| {
            Some(format!("<!-- failed: {} -->", ctx.url))
        }));
    let result = process(r#"a<esi:include src="/gone"/>b"#, config)
        .await
        .unwrap();
    assert_eq!(
        result,
        "a<!-- failed: http://www.example.com/gone -->b"
    );
}

#[tokio::test]
async fn include_error_handler_declining_keeps_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let config = Configuration::default()
        .with_fetch(dispatcher(&[]))
        .with_include_error_handler(Arc::new(move |_: &esi_stream::IncludeErrorContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        }));
    let err = process(r#"<esi:include src="/gone"/>"#, config)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::IncludeError { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn try_takes_attempt_on_success() {
    let config = Configuration::default().with_fetch(dispatcher(&[("/ok", 200, "fine")]));
    let input = concat!(
        r#"<esi:try>"#,
        r#"<esi:attempt>got <esi:include src="/ok"/></esi:attempt>"#,
        r#"<esi:except>failed</esi:except>"#,
        r#"</esi:try>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "got fine");
}

#[tokio::test]
async fn try_takes_except_on_include_error() {
    let config = Configuration::default().with_fetch(dispatcher(&[]));
    let input = concat!(
        r#"<esi:try>"#,
        r#"<esi:attempt>got <esi:include src="/gone"/></esi:attempt>"#,
        r#"<esi:except>failed</esi:except>"#,
        r#"</esi:try>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "failed");
}

// Structure errors inside an attempt are not caught by try.
#[tokio::test]
async fn try_does_not_catch_structure_errors() {
    let input = concat!(
        r#"<esi:try>"#,
        r#"<esi:attempt><esi:bogus/></esi:attempt>"#,
        r#"<esi:except>failed</esi:except>"#,
        r#"</esi:try>"#
    );
    let err = process(input, Configuration::default()).await.unwrap_err();
    assert!(matches!(err, ExecutionError::StructureError { .. }));
}

// Variable substitution applies inside try subtrees.
#[tokio::test]
async fn try_enables_variable_substitution() {
    let config = Configuration::default()
        .with_vars(Arc::new(MapVars::new(&[("WHO", "'world'")])))
        .with_fetch(dispatcher(&[("/hello", 200, "hi")]));
    let input = concat!(
        r#"<esi:try>"#,
        r#"<esi:attempt>$(WHO): <esi:include src="/hello"/></esi:attempt>"#,
        r#"<esi:except>down</esi:except>"#,
        r#"</esi:try>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "world: hi");
}

#[tokio::test]
async fn nested_choose_inside_vars() {
    let config =
        Configuration::default().with_vars(Arc::new(MapVars::new(&[("N", "'2'")])));
    let input = concat!(
        "<esi:vars>",
        "n=$(N) ",
        r#"<esi:choose>"#,
        r#"<esi:when test="$(N) == 1">one</esi:when>"#,
        r#"<esi:when test="$(N) == 2">two</esi:when>"#,
        r#"</esi:choose>"#,
        "</esi:vars>"
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "n=2 two");
}

// Attribute values of pass-through markup are substituted inside vars.
#[tokio::test]
async fn vars_substitutes_passthrough_attribute_values() {
    let config =
        Configuration::default().with_vars(Arc::new(MapVars::new(&[("ID", "'u42'")])));
    let input = concat!(
        r#"<x:a href="/user/$(ID)">x</x:a>"#,
        r#"<esi:vars><x:a href="/user/$(ID)">x</x:a></esi:vars>"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(
        result,
        concat!(
            r#"<x:a href="/user/$(ID)">x</x:a>"#,
            r#"<x:a href="/user/u42">x</x:a>"#
        )
    );
}

// Include URLs in HTML templates arrive entity-escaped.
#[tokio::test]
async fn include_url_is_entity_unescaped() {
    let urls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&urls);
    let fetch: Arc<FragmentDispatcher> = Arc::new(move |request: FragmentRequest| {
        seen.lock().unwrap().push(request.url.to_string());
        Box::pin(async move { Ok(FragmentResponse::new(StatusCode::OK).with_body("ok")) })
    });
    let config = Configuration::default().with_fetch(fetch);
    let result = process(r#"<esi:include src="/x?a=1&amp;b=2"/>"#, config)
        .await
        .unwrap();
    assert_eq!(result, "ok");
    assert_eq!(
        urls.lock().unwrap().as_slice(),
        ["http://www.example.com/x?a=1&b=2"]
    );
}

#[tokio::test]
async fn choose_rejects_two_otherwise_branches() {
    let input = concat!(
        r#"<esi:choose>"#,
        r#"<esi:when test="false">a</esi:when>"#,
        r#"<esi:otherwise>b</esi:otherwise>"#,
        r#"<esi:otherwise>c</esi:otherwise>"#,
        r#"</esi:choose>"#
    );
    let err = process(input, Configuration::default()).await.unwrap_err();
    assert!(matches!(err, ExecutionError::StructureError { tag, .. } if tag == "esi:choose"));
}

#[tokio::test]
async fn when_without_test_is_missing_parameter() {
    let input = "<esi:choose><esi:when>a</esi:when></esi:choose>";
    let err = process(input, Configuration::default()).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::MissingRequiredParameter(tag, attr)
            if tag == "esi:when" && attr == "test"
    ));
}

#[tokio::test]
async fn query_string_variables_from_request_url() {
    let url = Url::parse("http://www.example.com/page?param=value").unwrap();
    let result = transform_string(
        url,
        HeaderMap::new(),
        Configuration::default(),
        "<esi:vars>$(QUERY_STRING{param})</esi:vars>",
    )
    .await
    .unwrap();
    assert_eq!(result, "value");
}

#[tokio::test]
async fn cookie_and_language_variables_from_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("cookie", "id=571".parse().unwrap());
    headers.insert("accept-language", "en-gb, da".parse().unwrap());

    let input = concat!(
        "<esi:vars>",
        "$(HTTP_COOKIE{id}) ",
        "$(HTTP_ACCEPT_LANGUAGE{da}|'missing') ",
        "$(HTTP_ACCEPT_LANGUAGE{fr}|'missing')",
        "</esi:vars>"
    );
    let result = transform_string(base_url(), headers, Configuration::default(), input)
        .await
        .unwrap();
    // A true membership renders empty; a false one takes the default.
    assert_eq!(result, "571  missing");
}

#[tokio::test]
async fn small_output_capacity_still_flows() {
    let config = Configuration::default()
        .with_output_capacity(1)
        .with_fetch(dispatcher(&[("/a", 200, "A"), ("/b", 200, "B")]));
    let input = concat!(
        r#"start<esi:include src="/a"/>"#,
        r#"mid<esi:include src="/b"/>end"#
    );
    let result = process(input, config).await.unwrap();
    assert_eq!(result, "startAmidBend");
}

#[tokio::test]
async fn closed_consumer_signals_writer() {
    init_logs();
    let (mut stream, output) =
        EsiStream::new(base_url(), HeaderMap::new(), Configuration::default()).unwrap();
    drop(output);

    let mut result = Ok(());
    // The bounded channel may absorb a chunk before the closure is seen.
    for _ in 0..4 {
        result = stream.write(b"some top level text ").await;
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(ExecutionError::StreamClosed)));
}

#[tokio::test]
async fn unclosed_esi_subtree_is_closed_and_processed_at_finish() {
    // The forced flush closes the dangling subtree; the transformer then
    // consumes the vars directive as usual.
    let result = process("before<esi:vars>dangling", Configuration::default())
        .await
        .unwrap();
    assert_eq!(result, "beforedangling");
}

#[tokio::test]
async fn mismatched_close_tag_fails_the_stream() {
    let err = process("<esi:vars></esi:try>", Configuration::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::MismatchedClosingTag { .. }));
}
