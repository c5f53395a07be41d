// User-directed notification callback (§6.2): `(user_id, message) -> void`,
// fire-and-forget, invoked by the scheduling loop and the task executor.
// The messaging transport that actually delivers these is out of scope
// (§1 Non-goals); this module only defines the seam.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;

pub type NotifyCallback = Arc<dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Invoke the callback, never propagating a panic from within it to the caller.
pub async fn notify(cb: &NotifyCallback, user_id: impl Into<String>, message: impl Into<String>) {
    let fut = cb(user_id.into(), message.into());
    let _ = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
}
