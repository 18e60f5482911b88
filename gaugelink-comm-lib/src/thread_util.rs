//! Helper for spawning named threads
//!
//! Thread names show up in panic messages and in debuggers, which makes it
//! easy to tell one link's loop from another's.

use std::thread::JoinHandle;

/// Spawn a thread with a name.
///
/// # Example
/// ```ignore
/// spawn_named("ssm@/dev/ttyUSB0", || { /* ... */ })?;
/// ```
pub fn spawn_named<F, T>(name: &str, f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}
