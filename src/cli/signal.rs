//! Ctrl+C wiring for the chat loop.

use tracing::{debug, warn};

use crate::engine::CancellationToken;
use crate::error::InferenceError;

/// Raise `token` every time the user presses Ctrl+C.
///
/// The listener runs on its own thread with a single-threaded tokio runtime,
/// so the chat loop itself stays synchronous. The process is not terminated
/// by the signal; quitting is done with `quit()`.
pub fn install_interrupt_handler(token: CancellationToken) -> Result<(), InferenceError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            debug!("Received Ctrl+C");
                            token.cancel();
                        }
                        Err(e) => {
                            warn!(error = %e, "Ctrl+C listener failed");
                            break;
                        }
                    }
                }
            })
        })?;

    Ok(())
}
