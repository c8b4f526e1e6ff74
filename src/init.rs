use crate::dispatcher::Dispatcher;
use crate::layer::DispatchLayer;
use std::sync::Arc;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::Registry;

/// Configuration of the global `tracing` bridge.
///
/// **Fields**
/// - `diagnostics`: if `true`, a `tracing_subscriber::fmt` layer prints the
///   pipeline's own events (handler lifecycle, rotations, drops) to
///   standard error. Those events never go through the dispatcher.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub diagnostics: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { diagnostics: true }
    }
}

/// Install a global subscriber routing every `tracing` event into
/// `dispatcher`.
///
/// **Parameters**
/// - `dispatcher`: receives a [`Record`](crate::record::Record) per event.
/// - `config`: [`LayerConfig`] controlling the diagnostics output.
///
/// **Returns**
/// - `Err(..)` if a global subscriber is already installed.
pub fn init_tracing_with_config(
    dispatcher: Arc<Dispatcher>,
    config: LayerConfig,
) -> Result<(), SetGlobalDefaultError> {
    let layer = DispatchLayer::new(dispatcher);
    let diagnostics = config.diagnostics.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter_fn(|meta| meta.target().starts_with("log_pipeline")))
    });

    let subscriber = Registry::default().with(layer).with(diagnostics);
    tracing::subscriber::set_global_default(subscriber)
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(dispatcher: Arc<Dispatcher>) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(dispatcher, LayerConfig::default())
}
