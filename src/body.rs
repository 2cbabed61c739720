use std::io;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

pub type BoxedBody = BoxBody<Bytes, io::Error>;

pub fn empty() -> BoxedBody {
    Full::new(Bytes::new()).map_err(|err| match err {}).boxed()
}

pub fn full(bytes: Bytes) -> BoxedBody {
    Full::new(bytes).map_err(|err| match err {}).boxed()
}

/// Streams an `AsyncRead` (a blob file, possibly seek-and-take limited).
pub fn from_reader<R>(reader: R) -> BoxedBody
where
    R: AsyncRead + Send + Sync + 'static,
{
    StreamBody::new(ReaderStream::new(reader).map(|chunk| chunk.map(Frame::data))).boxed()
}

/// Streams chunks fed through a bounded channel (the client side of the
/// fetch-and-tee). An `Err` chunk aborts the response so the connection
/// closes instead of ending cleanly short.
pub fn from_channel(rx: mpsc::Receiver<io::Result<Bytes>>) -> BoxedBody {
    StreamBody::new(ReceiverStream::new(rx).map(|chunk| chunk.map(Frame::data))).boxed()
}

/// Passes an upstream body straight through (bypass / non-200 responses).
pub fn from_incoming(body: Incoming) -> BoxedBody {
    body.map_err(io::Error::other).boxed()
}

pub fn text_response(status: StatusCode, text: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full(Bytes::from(text.to_string())))
        .unwrap()
}

pub fn json_response<T: serde::Serialize>(payload: &T) -> Response<BoxedBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(full(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}
