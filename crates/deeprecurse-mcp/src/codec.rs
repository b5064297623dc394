use serde::Serialize;

pub const EVENT_STREAM: &str = "text/event-stream";
pub const APPLICATION_JSON: &str = "application/json";

/// How a single (non-batch) reply is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEncoding {
    Json,
    EventStream,
}

impl ResponseEncoding {
    /// Picks the push-stream framing whenever the caller's `Accept` header
    /// lists `text/event-stream` without `q=0`.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Json;
        };
        let streams = accept.split(',').any(|range| {
            let mut parts = range.split(';').map(str::trim);
            let media = parts.next().unwrap_or_default();
            media.eq_ignore_ascii_case(EVENT_STREAM) && !parts.any(is_zero_quality)
        });
        if streams {
            Self::EventStream
        } else {
            Self::Json
        }
    }
}

fn is_zero_quality(param: &str) -> bool {
    param
        .split_once('=')
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
        .and_then(|(_, value)| value.trim().parse::<f32>().ok())
        .is_some_and(|q| q <= 0.0)
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    /// Streams carry no `Content-Length`; the connection close ends them.
    pub streaming: bool,
}

impl HttpResponse {
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self {
            status,
            content_type: APPLICATION_JSON,
            headers: Vec::new(),
            body,
            streaming: false,
        }
    }

    pub fn text(status: u16, content_type: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            headers: Vec::new(),
            body: body.into().into_bytes(),
            streaming: false,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self::text(status, "text/plain; charset=utf-8", String::new())
    }

    /// Exactly one `message` event carrying the whole payload.
    pub fn event_stream<T: Serialize + ?Sized>(payload: &T) -> Self {
        Self {
            status: 200,
            content_type: EVENT_STREAM,
            headers: vec![("Cache-Control", "no-cache".to_string())],
            body: sse_frame("message", payload).into_bytes(),
            streaming: true,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

pub fn sse_frame<T: Serialize + ?Sized>(event: &str, payload: &T) -> String {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("event: {event}\ndata: {data}\n\n")
}

/// Frames one reply according to the negotiated encoding. `status` applies to
/// plain JSON only; a stream always opens with 200.
pub fn encode<T: Serialize + ?Sized>(
    encoding: ResponseEncoding,
    status: u16,
    payload: &T,
) -> HttpResponse {
    match encoding {
        ResponseEncoding::Json => HttpResponse::json(status, payload),
        ResponseEncoding::EventStream => HttpResponse::event_stream(payload),
    }
}
