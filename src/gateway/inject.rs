//! Rewriting of HTML responses, splicing the client script in front of the closing body tag.
//!
//! The decision is made once, from the headers of the response start. Responses that are
//! rewritten get buffered until the final body chunk arrived, as only then it's known where the
//! closing tag is, or that there is none. All other responses are forwarded untouched, message by
//! message.

use std::mem;

use axum::{
    body::Bytes,
    http::{
        header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
};
use tracing::{debug, trace, warn};

use crate::protocol::{ProtocolError, ResponseMessage};

const CLOSING_BODY: &[u8] = b"</body>";

/// Why a response is left alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Skip {
    NotHtml,
    Chunked,
    Compressed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Decision {
    Inject,
    Passthrough(Skip),
}

/// Decide from the response headers whether the body can be safely rewritten.
pub(super) fn decide(headers: &HeaderMap) -> Decision {
    let is_html = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("text/html"));

    if !is_html {
        return Decision::Passthrough(Skip::NotHtml);
    }

    if list_values(headers, &TRANSFER_ENCODING).any(|coding| coding.eq_ignore_ascii_case("chunked"))
    {
        return Decision::Passthrough(Skip::Chunked);
    }

    if list_values(headers, &CONTENT_ENCODING)
        .any(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"))
    {
        return Decision::Passthrough(Skip::Compressed);
    }

    Decision::Inject
}

/// Iterate over the comma separated elements of all values of a header. Values that aren't valid
/// strings count as a single unknown element.
fn list_values<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .map(|value| value.to_str().unwrap_or("?"))
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

/// Byte offset of the last `</body>` tag, ignoring ASCII case.
pub(super) fn find_closing_body(html: &[u8]) -> Option<usize> {
    html.windows(CLOSING_BODY.len())
        .rposition(|window| window.eq_ignore_ascii_case(CLOSING_BODY))
}

/// Insert the script right before the last closing body tag, or at the very end if there is
/// none. Chunk boundaries are kept, only the chunk holding the insertion point is rebuilt.
pub(super) fn splice(chunks: Vec<Bytes>, script: &[u8]) -> Vec<Bytes> {
    let total = chunks.iter().map(Bytes::len).sum::<usize>();
    let offset = match chunks.as_slice() {
        [single] => find_closing_body(single),
        _ => find_closing_body(&chunks.concat()),
    }
    .unwrap_or(total);

    let mut spliced = Vec::with_capacity(chunks.len().max(1));
    let mut start = 0;
    let mut inserted = false;

    for chunk in chunks {
        let end = start + chunk.len();

        if !inserted && offset < end {
            spliced.push(insert(&chunk, offset - start, script));
            inserted = true;
        } else {
            spliced.push(chunk);
        }

        start = end;
    }

    if !inserted {
        let last = spliced.pop().unwrap_or_default();
        spliced.push(insert(&last, last.len(), script));
    }

    spliced
}

fn insert(chunk: &[u8], at: usize, script: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(chunk.len() + script.len());
    buf.extend_from_slice(&chunk[..at]);
    buf.extend_from_slice(script);
    buf.extend_from_slice(&chunk[at..]);
    buf.into()
}

/// Set `Content-Length` to the declared length plus the injected bytes. Without a usable declared
/// length, the actual length of the rewritten body is used.
pub(super) fn patch_content_length(headers: &mut HeaderMap, injected: usize, actual: usize) {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<usize>().ok());

    let length = declared.map_or(actual, |declared| declared + injected);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
}

enum State {
    AwaitingStart,
    Passthrough,
    Buffering {
        status: StatusCode,
        headers: HeaderMap,
        chunks: Vec<Bytes>,
    },
    Finished,
}

/// Sits between the application's response messages and the host, rewriting eligible responses.
pub(super) struct Rewriter<S> {
    state: State,
    /// Produces the script tag, only called for responses that get rewritten.
    script: S,
    host: flume::Sender<ResponseMessage>,
}

impl<S: FnMut() -> Bytes> Rewriter<S> {
    pub(super) fn new(host: flume::Sender<ResponseMessage>, script: S) -> Self {
        Self {
            state: State::AwaitingStart,
            script,
            host,
        }
    }

    /// Process all response messages until the application is done sending.
    pub(super) async fn run(
        mut self,
        responses: flume::Receiver<ResponseMessage>,
    ) -> Result<(), ProtocolError> {
        while let Ok(message) = responses.recv_async().await {
            self.handle(message).await?;
        }

        match self.state {
            State::Buffering { .. } => Err(ProtocolError::IncompleteBody),
            _ => Ok(()),
        }
    }

    async fn handle(&mut self, message: ResponseMessage) -> Result<(), ProtocolError> {
        self.state = match (mem::replace(&mut self.state, State::Finished), message) {
            (State::AwaitingStart, ResponseMessage::Start { status, headers }) => {
                match decide(&headers) {
                    Decision::Inject => State::Buffering {
                        status,
                        headers,
                        chunks: Vec::new(),
                    },
                    Decision::Passthrough(skip) => {
                        if skip == Skip::Compressed {
                            warn!(
                                encoding = ?headers.get(CONTENT_ENCODING),
                                "can't inject the reload script into a compressed response, \
                                 place the reload gateway before any compression layer"
                            );
                        } else {
                            trace!(?skip, "passing response through");
                        }

                        self.send(ResponseMessage::Start { status, headers })
                            .await?;
                        State::Passthrough
                    }
                }
            }
            (State::AwaitingStart, ResponseMessage::Body { .. }) => {
                return Err(ProtocolError::BodyBeforeStart);
            }
            (State::Passthrough, message) => {
                self.send(message).await?;
                State::Passthrough
            }
            (State::Buffering { .. }, ResponseMessage::Start { .. }) => {
                return Err(ProtocolError::DuplicateStart);
            }
            (
                State::Buffering {
                    status,
                    headers,
                    mut chunks,
                },
                ResponseMessage::Body { body, more_body },
            ) => {
                if !body.is_empty() {
                    chunks.push(body);
                }

                if more_body {
                    State::Buffering {
                        status,
                        headers,
                        chunks,
                    }
                } else {
                    self.flush(status, headers, chunks).await?;
                    State::Finished
                }
            }
            (State::Finished, _) => return Err(ProtocolError::BodyAfterEnd),
        };

        Ok(())
    }

    async fn flush(
        &mut self,
        status: StatusCode,
        mut headers: HeaderMap,
        chunks: Vec<Bytes>,
    ) -> Result<(), ProtocolError> {
        let script = (self.script)();
        let chunks = splice(chunks, &script);
        let length = chunks.iter().map(Bytes::len).sum();

        patch_content_length(&mut headers, script.len(), length);
        debug!(length, script = script.len(), "injected reload script");

        self.send(ResponseMessage::Start { status, headers })
            .await?;

        let last = chunks.len() - 1;
        for (i, body) in chunks.into_iter().enumerate() {
            self.send(ResponseMessage::Body {
                body,
                more_body: i < last,
            })
            .await?;
        }

        Ok(())
    }

    async fn send(&self, message: ResponseMessage) -> Result<(), ProtocolError> {
        self.host
            .send_async(message)
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &[u8] = b"<script>reload()</script>";

    fn headers(pairs: &[(HeaderName, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(name, value)| (name.clone(), HeaderValue::from_static(value)))
            .collect()
    }

    fn html_headers(length: usize) -> HeaderMap {
        let mut headers = headers(&[(CONTENT_TYPE, "text/html; charset=utf-8")]);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        headers
    }

    fn bytes(chunks: &[&'static str]) -> Vec<Bytes> {
        chunks.iter().map(|c| Bytes::from_static(c.as_bytes())).collect()
    }

    async fn rewrite(
        messages: Vec<ResponseMessage>,
    ) -> (Result<(), ProtocolError>, Vec<ResponseMessage>) {
        let (app_tx, app_rx) = flume::unbounded();
        let (host_tx, host_rx) = flume::unbounded();

        for message in messages {
            app_tx.send(message).unwrap();
        }
        drop(app_tx);

        let res = Rewriter::new(host_tx, || Bytes::from_static(SCRIPT))
            .run(app_rx)
            .await;

        (res, host_rx.drain().collect())
    }

    #[test]
    fn decide_by_headers() {
        assert_eq!(
            Decision::Inject,
            decide(&headers(&[(CONTENT_TYPE, "text/html")]))
        );
        assert_eq!(
            Decision::Inject,
            decide(&headers(&[(CONTENT_TYPE, "Text/HTML ; charset=utf-8")]))
        );
        assert_eq!(
            Decision::Inject,
            decide(&headers(&[
                (CONTENT_TYPE, "text/html"),
                (CONTENT_ENCODING, "identity")
            ]))
        );
        assert_eq!(
            Decision::Passthrough(Skip::NotHtml),
            decide(&headers(&[(CONTENT_TYPE, "application/json")]))
        );
        assert_eq!(
            Decision::Passthrough(Skip::NotHtml),
            decide(&headers(&[(CONTENT_TYPE, "text/htmlx")]))
        );
        assert_eq!(Decision::Passthrough(Skip::NotHtml), decide(&HeaderMap::new()));
        assert_eq!(
            Decision::Passthrough(Skip::Chunked),
            decide(&headers(&[
                (CONTENT_TYPE, "text/html"),
                (TRANSFER_ENCODING, "gzip, chunked")
            ]))
        );
        assert_eq!(
            Decision::Passthrough(Skip::Compressed),
            decide(&headers(&[
                (CONTENT_TYPE, "text/html"),
                (CONTENT_ENCODING, "br")
            ]))
        );
    }

    #[test]
    fn find_last_closing_tag() {
        assert_eq!(Some(6), find_closing_body(b"<body></body>"));
        assert_eq!(Some(13), find_closing_body(b"</body><body></BODY>"));
        assert_eq!(None, find_closing_body(b"<h1>Hi</h1>"));
        assert_eq!(None, find_closing_body(b"</bod"));
    }

    #[test]
    fn splice_before_closing_tag() {
        let html = "<html><body><h1>Hi</h1></body></html>";
        let marker = html.find("</body>").unwrap();

        let spliced = splice(bytes(&[html]), SCRIPT).concat();

        assert_eq!(
            Some(marker + SCRIPT.len()),
            find_closing_body(&spliced),
            "marker moved by exactly the script length"
        );
        assert_eq!(&spliced[marker..marker + SCRIPT.len()], SCRIPT);
        assert_eq!(
            "<html><body><h1>Hi</h1><script>reload()</script></body></html>",
            String::from_utf8(spliced).unwrap()
        );
    }

    #[test]
    fn splice_keeps_chunk_boundaries() {
        let spliced = splice(bytes(&["<body>a", "b</bo", "dy>", "</html>"]), SCRIPT);

        assert_eq!(
            bytes(&[
                "<body>a",
                "b<script>reload()</script></bo",
                "dy>",
                "</html>"
            ]),
            spliced
        );
    }

    #[test]
    fn splice_appends_without_closing_tag() {
        let spliced = splice(bytes(&["<h1>Hello", ", world!</h1>"]), SCRIPT);
        let joined = spliced.concat();

        assert_eq!(2, spliced.len());
        assert!(joined.starts_with(b"<h1>Hello, world!</h1>"));
        assert!(joined.ends_with(SCRIPT));
        assert_eq!(vec![Bytes::from_static(SCRIPT)], splice(Vec::new(), SCRIPT));
    }

    #[test]
    fn content_length_is_patched() {
        let mut declared = html_headers(41);
        patch_content_length(&mut declared, 25, 66);
        assert_eq!("66", declared[CONTENT_LENGTH]);

        let mut missing = HeaderMap::new();
        patch_content_length(&mut missing, 25, 30);
        assert_eq!("30", missing[CONTENT_LENGTH]);

        let mut invalid = headers(&[(CONTENT_LENGTH, "nope")]);
        patch_content_length(&mut invalid, 25, 30);
        assert_eq!("30", invalid[CONTENT_LENGTH]);
    }

    #[tokio::test]
    async fn rewrite_html_response() {
        let html = "<html><body><h1>Hi</h1></body></html>";
        let (res, out) = rewrite(vec![
            ResponseMessage::Start {
                status: StatusCode::OK,
                headers: html_headers(html.len()),
            },
            ResponseMessage::last(html),
        ])
        .await;

        res.unwrap();
        let [ResponseMessage::Start { headers, .. }, ResponseMessage::Body { body, more_body }] =
            out.as_slice()
        else {
            panic!("unexpected messages: {out:?}");
        };

        assert_eq!(
            (html.len() + SCRIPT.len()).to_string(),
            headers[CONTENT_LENGTH]
        );
        assert_eq!(html.len() + SCRIPT.len(), body.len());
        assert!(!more_body);
        assert_eq!(
            &b"<html><body><h1>Hi</h1><script>reload()</script></body></html>"[..],
            &body[..]
        );
    }

    #[tokio::test]
    async fn rewrite_buffers_multi_part_bodies() {
        let (res, out) = rewrite(vec![
            ResponseMessage::Start {
                status: StatusCode::OK,
                headers: html_headers(20),
            },
            ResponseMessage::chunk("<body>"),
            ResponseMessage::chunk(""),
            ResponseMessage::chunk("text"),
            ResponseMessage::last("</body>\n</html>"),
        ])
        .await;

        res.unwrap();
        assert_eq!(4, out.len());
        assert!(matches!(
            &out[0],
            ResponseMessage::Start { headers, .. } if headers[CONTENT_LENGTH] == "45"
        ));
        assert!(matches!(
            &out[1],
            ResponseMessage::Body { body, more_body: true } if body == "<body>"
        ));
        assert!(matches!(
            &out[2],
            ResponseMessage::Body { body, more_body: true } if body == "text"
        ));
        assert!(matches!(
            &out[3],
            ResponseMessage::Body { body, more_body: false }
                if body == "<script>reload()</script></body>\n</html>"
        ));
    }

    #[tokio::test]
    async fn untouched_responses_are_identical() {
        let cases = [
            headers(&[(CONTENT_TYPE, "application/json")]),
            headers(&[(CONTENT_TYPE, "text/html"), (CONTENT_ENCODING, "gzip")]),
            headers(&[(CONTENT_TYPE, "text/html"), (TRANSFER_ENCODING, "chunked")]),
        ];

        for headers in cases {
            let messages = vec![
                ResponseMessage::Start {
                    status: StatusCode::OK,
                    headers,
                },
                ResponseMessage::chunk("<body>"),
                ResponseMessage::last("</body>"),
            ];

            let (res, out) = rewrite(messages.clone()).await;
            res.unwrap();
            assert_eq!(messages, out);
        }
    }

    #[tokio::test]
    async fn protocol_violations() {
        let start = || ResponseMessage::Start {
            status: StatusCode::OK,
            headers: html_headers(4),
        };

        let (res, out) = rewrite(vec![ResponseMessage::last("oops")]).await;
        assert!(matches!(res, Err(ProtocolError::BodyBeforeStart)));
        assert!(out.is_empty());

        let (res, _) = rewrite(vec![start(), start()]).await;
        assert!(matches!(res, Err(ProtocolError::DuplicateStart)));

        let (res, out) = rewrite(vec![
            start(),
            ResponseMessage::last("done"),
            ResponseMessage::last("more"),
        ])
        .await;
        assert!(matches!(res, Err(ProtocolError::BodyAfterEnd)));
        assert_eq!(2, out.len(), "complete response went out before the error");

        let (res, out) = rewrite(vec![start(), ResponseMessage::chunk("half")]).await;
        assert!(matches!(res, Err(ProtocolError::IncompleteBody)));
        assert!(out.is_empty());
    }
}
