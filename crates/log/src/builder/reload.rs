//! Reload logic for runtime filter changes

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing_subscriber::{EnvFilter, Registry, layer::Layer};

use crate::error::{LogError, LogResult};

/// Handle for runtime filter changes
#[derive(Clone)]
pub struct ReloadHandle {
    filter: tracing_subscriber::reload::Handle<EnvFilter, Registry>,
    /// Current filter string; lock-free reads via ArcSwap
    current_filter: Arc<ArcSwap<String>>,
}

impl ReloadHandle {
    /// Replace the active filter
    ///
    /// # Errors
    /// Returns error if filter parsing fails or the subscriber is gone
    pub fn reload(&self, filter: &str) -> LogResult<()> {
        let new_filter = parse_filter(filter)?;
        self.filter
            .reload(new_filter)
            .map_err(|e| LogError::Reload(e.to_string()))?;
        self.current_filter.store(Arc::new(filter.to_string()));
        Ok(())
    }

    pub fn current_filter(&self) -> Arc<String> {
        self.current_filter.load_full()
    }
}

impl std::fmt::Debug for ReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadHandle")
            .field("current_filter", &self.current_filter.load())
            .finish_non_exhaustive()
    }
}

pub(super) fn parse_filter(directives: &str) -> LogResult<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| LogError::Filter(format!("{directives}: {e}")))
}

/// Create a filter layer, optionally wrapped so it can be reloaded
pub(super) fn create_filter_layer(
    filter: EnvFilter,
    level: &str,
    reloadable: bool,
) -> (
    Box<dyn Layer<Registry> + Send + Sync + 'static>,
    Option<ReloadHandle>,
) {
    if reloadable {
        let (layer, handle) = tracing_subscriber::reload::Layer::new(filter);
        let reload_handle = ReloadHandle {
            filter: handle,
            current_filter: Arc::new(ArcSwap::from_pointee(level.to_string())),
        };
        (Box::new(layer), Some(reload_handle))
    } else {
        (Box::new(filter), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directive_is_a_filter_error() {
        let err = parse_filter("procpool=loud").unwrap_err();
        assert!(matches!(err, LogError::Filter(ref msg) if msg.starts_with("procpool=loud")));
    }

    #[test]
    fn reloadable_layer_tracks_current_filter() {
        let filter = parse_filter("info").unwrap();
        let (_layer, handle) = create_filter_layer(filter, "info", true);
        let handle = handle.expect("reloadable layer has a handle");
        assert_eq!(handle.current_filter().as_str(), "info");

        // Parsing is checked before the subscriber is touched
        assert!(matches!(
            handle.reload("procpool=loud"),
            Err(LogError::Filter(_))
        ));
        assert_eq!(handle.current_filter().as_str(), "info");
    }

    #[test]
    fn static_layer_has_no_handle() {
        let filter = parse_filter("warn").unwrap();
        let (_layer, handle) = create_filter_layer(filter, "warn", false);
        assert!(handle.is_none());
    }
}
