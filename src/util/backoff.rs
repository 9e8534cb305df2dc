//! Bounded exponential backoff for polling remote control planes

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const INITIAL_DELAY: Duration = Duration::from_millis(150);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Call `f` until it returns `Ok(true)`, sleeping 150ms, 300ms, ... capped at 2s.
///
/// Transient errors from `f` count as "not yet"; any other error ends the wait.
/// Once `max_duration` has elapsed the wait gives up with `Timeout(message)`.
pub fn backoff<F>(max_duration: Duration, message: &str, mut f: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;

    loop {
        match f() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_transient() => log::warn!("{}: retrying after {}", message, e),
            Err(e) => return Err(e),
        }
        if start.elapsed() > max_duration {
            return Err(Error::Timeout(message.to_string()));
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(MAX_DELAY);
    }
}
