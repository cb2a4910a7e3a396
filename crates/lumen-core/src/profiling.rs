//! Profiling utilities based on the `puffin` crate.

pub use puffin::{GlobalProfiler, profile_function, profile_scope};

/// Address the puffin HTTP server listens on.
pub const DEFAULT_PROFILER_ADDR: &str = "0.0.0.0:8585";

#[cfg(feature = "profiling")]
static PROFILING_SERVER: std::sync::OnceLock<puffin_http::Server> = std::sync::OnceLock::new();

/// Turn on puffin scopes and start the HTTP server on [`DEFAULT_PROFILER_ADDR`].
///
/// Failure to bind the server is logged and otherwise ignored; scopes stay enabled so
/// in-process consumers still see data.
///
/// ```no_run
/// lumen_core::profiling::init_profiling();
/// ```
#[cfg(feature = "profiling")]
pub fn init_profiling() {
    puffin::set_scopes_on(true);

    match puffin_http::Server::new(DEFAULT_PROFILER_ADDR) {
        Ok(server) => {
            tracing::info!("Puffin profiler server started on http://{DEFAULT_PROFILER_ADDR}");
            let _ = PROFILING_SERVER.set(server);
        }
        Err(e) => {
            tracing::error!("Failed to start puffin server: {}", e);
        }
    }
}

/// Whether puffin is currently collecting scopes.
pub fn is_enabled() -> bool {
    puffin::are_scopes_on()
}

/// Mark a frame boundary. Call once per rendered frame.
#[inline]
pub fn new_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}
