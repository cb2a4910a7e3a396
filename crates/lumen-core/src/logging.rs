use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "debug,wgpu_core=info,wgpu_hal=info,naga=info";

/// Install the global fmt subscriber with [`DEFAULT_FILTER`].
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `filter` when present. Calling this more than
/// once is harmless; later calls are ignored.
pub fn init_with_filter(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::trace!("Global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_with_filter("warn");
        init();
    }
}
