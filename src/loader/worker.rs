use std::io;
use std::sync::mpsc;

/// Runs `work` on a named background thread and hands back the receiving end
/// of its result channel. The receiver is polled by the owner's event loop.
pub(super) fn spawn_worker<T, W>(name: &str, work: W) -> io::Result<mpsc::Receiver<T>>
where
    T: Send + 'static,
    W: FnOnce() -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(result) = work() {
                let _ = tx.send(result);
            }
        })?;
    Ok(rx)
}

/// Runs `work` on the calling thread; the result is already waiting in the
/// returned channel.
pub(super) fn run_inline<T, W>(work: W) -> mpsc::Receiver<T>
where
    W: FnOnce() -> Option<T>,
{
    let (tx, rx) = mpsc::channel::<T>();
    if let Some(result) = work() {
        let _ = tx.send(result);
    }
    rx
}
