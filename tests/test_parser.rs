use tarn::{Method, ParseError, ParseState, Parser, Version};

#[test]
fn parse_simple_get_request() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

    assert!(outcome.is_complete());
    let req = parser.take_request().unwrap();
    assert_eq!(req.method(), Method::Get);
    assert_eq!(req.path(), "/");
    assert_eq!(req.version(), Version::Http11);
    assert_eq!(req.header("Host"), Some("example.com"));
}

#[test]
fn parse_post_request_with_body() {
    let mut parser = Parser::new();
    let outcome =
        parser.parse(b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello");

    assert!(outcome.is_complete());
    let req = parser.take_request().unwrap();
    assert_eq!(req.method(), Method::Post);
    assert_eq!(req.body(), b"hello");
    assert_eq!(req.content_length(), 5);
}

#[test]
fn parse_multiple_headers_preserving_case() {
    let mut parser = Parser::new();
    parser.parse(
        b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n",
    );

    let req = parser.take_request().unwrap();
    assert_eq!(req.header("host"), Some("example.com"));
    assert_eq!(req.header("USER-AGENT"), Some("test-client"));
    assert_eq!(req.headers().names(), vec!["Host", "User-Agent", "Accept"]);
}

#[test]
fn query_string_is_split_from_path() {
    let mut parser = Parser::new();
    parser.parse(b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: x\r\n\r\n");

    let req = parser.take_request().unwrap();
    assert_eq!(req.path(), "/search");
    assert_eq!(req.query(), "q=rust&page=2");
    assert_eq!(req.query_param("q"), Some("rust"));
    assert_eq!(req.query_param("page"), Some("2"));
}

#[test]
fn http10_version_is_accepted() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"GET / HTTP/1.0\r\n\r\n");

    assert!(outcome.is_complete());
    assert_eq!(parser.take_request().unwrap().version(), Version::Http10);
}

#[test]
fn incomplete_request_keeps_parsing_state() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n");

    assert!(!outcome.is_complete());
    assert!(parser.is_parsing());
    assert_eq!(parser.state(), ParseState::Headers);
}

#[test]
fn partial_body_waits_for_more_data() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello");

    assert!(!outcome.is_complete());
    assert_eq!(outcome.state, ParseState::Body);

    let finish = parser.parse(b"world");
    assert!(finish.is_complete());
    assert_eq!(parser.take_request().unwrap().body(), b"helloworld");
}

#[test]
fn bad_version_reports_unsupported_version() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"GET / HTTP/9.9\r\n\r\n");

    assert_eq!(outcome.state, ParseState::Error);
    assert_eq!(
        outcome.error,
        Some(ParseError::UnsupportedVersion("HTTP/9.9".into()))
    );
    assert!(parser.take_request().is_none());
}

#[test]
fn reset_recovers_from_error_state() {
    let mut parser = Parser::new();
    parser.parse(b"NOPE / HTTP/1.1\r\n\r\n");
    assert_eq!(parser.state(), ParseState::Error);

    parser.reset();
    assert_eq!(parser.state(), ParseState::StartLine);
    assert!(parser.parse(b"GET / HTTP/1.1\r\n\r\n").is_complete());
}

#[test]
fn chunked_post_reassembles_body() {
    let mut parser = Parser::new();
    let outcome = parser.parse(
        b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );

    assert!(outcome.is_complete());
    let req = parser.take_request().unwrap();
    assert!(req.is_chunked());
    assert_eq!(req.body(), b"hello");
}

#[test]
fn chunked_body_with_only_terminator_is_empty() {
    let mut parser = Parser::new();
    let outcome =
        parser.parse(b"POST /e HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n");

    assert!(outcome.is_complete());
    assert!(parser.take_request().unwrap().body().is_empty());
}

#[test]
fn content_length_zero_completes_with_empty_body() {
    let mut parser = Parser::new();
    let outcome = parser.parse(b"POST /e HTTP/1.1\r\nContent-Length: 0\r\n\r\n");

    assert!(outcome.is_complete());
    assert!(parser.take_request().unwrap().body().is_empty());
}

#[test]
fn split_anywhere_equals_single_shot_parse() {
    let raw: &[u8] = b"PUT /items/9?force=1 HTTP/1.1\r\nHost: h\r\nX-Tag: a\r\nContent-Length: 3\r\n\r\nxyz";

    let mut reference = Parser::new();
    assert!(reference.parse(raw).is_complete());
    let expected = reference.take_request().unwrap();

    for split in 0..=raw.len() {
        let mut parser = Parser::new();
        parser.parse(&raw[..split]);
        let outcome = parser.parse(&raw[split..]);
        assert!(outcome.is_complete(), "split at {split} did not complete");
        assert_eq!(parser.take_request().unwrap(), expected, "split at {split}");
    }
}

#[test]
fn chunked_split_anywhere_equals_single_shot_parse() {
    let raw: &[u8] = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\na\r\n0123456789\r\n0\r\n\r\n";

    let mut reference = Parser::new();
    assert!(reference.parse(raw).is_complete());
    let expected = reference.take_request().unwrap();
    assert_eq!(expected.body(), b"abc0123456789");

    for split in 0..=raw.len() {
        let mut parser = Parser::new();
        parser.parse(&raw[..split]);
        let outcome = parser.parse(&raw[split..]);
        assert!(outcome.is_complete(), "split at {split} did not complete");
        assert_eq!(parser.take_request().unwrap(), expected, "split at {split}");
    }
}

#[test]
fn reserialize_then_reparse_round_trips() {
    let raw: &[u8] = b"POST /submit?lang=en HTTP/1.1\r\nHost: svc\r\nX-Req: 1\r\nContent-Length: 6\r\n\r\nabcdef";

    let mut parser = Parser::new();
    assert!(parser.parse(raw).is_complete());
    let original = parser.take_request().unwrap();

    let mut second = Parser::new();
    assert!(second.parse(&original.to_bytes()).is_complete());
    let reparsed = second.take_request().unwrap();

    assert_eq!(reparsed, original);
    assert_eq!(reparsed.headers().names(), original.headers().names());
}

#[test]
fn trailing_pipelined_bytes_are_not_consumed_into_request() {
    let mut parser = Parser::new();
    let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\n";
    let outcome = parser.parse(raw);

    assert!(outcome.is_complete());
    let req = parser.take_request().unwrap();
    assert_eq!(req.path(), "/a");
    assert!(req.body().is_empty());
}
