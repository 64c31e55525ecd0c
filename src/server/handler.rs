use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Codec;

/// Outcome of one handler invocation: encoded result or error text.
pub(crate) type HandlerResult = std::result::Result<Bytes, String>;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased handler.
///
/// Takes the encoded argument and yields the encoded result or the failure
/// text that is sent back to the caller. Argument decode and result encode
/// failures are handler failures.
pub(crate) trait HandlerFn<C: Codec>: Send + Sync {
    fn call(&self, codec: &C, payload: Bytes) -> BoxFuture<'static, HandlerResult>;
}

/// Shared handler pointer stored in the dispatch table.
pub(crate) type BoxedHandler<C> = Arc<dyn HandlerFn<C>>;

// Async handler: `Fn(Req) -> impl Future<Output = Result<Resp, E>>`
struct AsyncHandler<F, Fut, Req, Resp, E> {
    func: F,
    _phantom: PhantomData<fn(Req, Resp, E, Fut)>,
}

impl<C, F, Fut, Req, Resp, E> HandlerFn<C> for AsyncHandler<F, Fut, Req, Resp, E>
where
    C: Codec,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, codec: &C, payload: Bytes) -> BoxFuture<'static, HandlerResult> {
        // ---
        let req: Req = match codec.decode(&payload) {
            Ok(r) => r,
            Err(e) => {
                let msg = e.to_string();
                return Box::pin(async move { Err(msg) });
            }
        };

        let fut = (self.func)(req);
        let codec = codec.clone();

        Box::pin(async move {
            let resp = fut.await.map_err(|e| e.to_string())?;
            codec.encode(&resp).map_err(|e| e.to_string())
        })
    }
}

// Synchronous handler: `Fn(Req) -> Result<Resp, E>`, run inline on the
// dispatch task.
struct SyncHandler<F, Req, Resp, E> {
    func: F,
    _phantom: PhantomData<fn(Req, Resp, E)>,
}

impl<C, F, Req, Resp, E> HandlerFn<C> for SyncHandler<F, Req, Resp, E>
where
    C: Codec,
    F: Fn(Req) -> std::result::Result<Resp, E> + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, codec: &C, payload: Bytes) -> BoxFuture<'static, HandlerResult> {
        // ---
        let result = codec
            .decode::<Req>(&payload)
            .map_err(|e| e.to_string())
            .and_then(|req| (self.func)(req).map_err(|e| e.to_string()))
            .and_then(|resp| codec.encode(&resp).map_err(|e| e.to_string()));

        Box::pin(async move { result })
    }
}

/// Wrap an async function into a type-erased handler.
pub(crate) fn wrap_async<C, F, Fut, Req, Resp, E>(func: F) -> BoxedHandler<C>
where
    C: Codec,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    Arc::new(AsyncHandler {
        func,
        _phantom: PhantomData,
    })
}

/// Wrap a blocking-free synchronous function into a type-erased handler.
pub(crate) fn wrap_sync<C, F, Req, Resp, E>(func: F) -> BoxedHandler<C>
where
    C: Codec,
    F: Fn(Req) -> std::result::Result<Resp, E> + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    Arc::new(SyncHandler {
        func,
        _phantom: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Json, MsgPack};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_async_handler_roundtrip() {
        // ---
        let handler: BoxedHandler<MsgPack> =
            wrap_async(|args: Args| async move { Ok::<_, String>(args.a * args.b) });

        let payload = MsgPack.encode(&Args { a: 6, b: 7 }).unwrap();
        let out = handler.call(&MsgPack, payload).await.unwrap();
        assert_eq!(MsgPack.decode::<i64>(&out).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_handler_error_text_is_kept() {
        // ---
        let handler: BoxedHandler<Json> =
            wrap_sync(|_: Args| Err::<i64, _>("division by zero"));

        let payload = Json.encode(&Args { a: 1, b: 0 }).unwrap();
        let err = handler.call(&Json, payload).await.unwrap_err();
        assert_eq!(err, "division by zero");
    }

    #[tokio::test]
    async fn test_bad_argument_is_handler_failure() {
        // ---
        let handler: BoxedHandler<Json> = wrap_sync(|args: Args| Ok::<_, String>(args.a));

        let err = handler
            .call(&Json, Bytes::from_static(b"[1,2,3"))
            .await
            .unwrap_err();
        assert!(err.starts_with("json decode failed"), "{err}");
    }
}
