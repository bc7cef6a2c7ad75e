//! Shared handles to the transport's external collaborators.

use std::sync::Arc;

use crate::cm_event::CmProvider;
use crate::config::RdmaCmConfig;
use crate::dispatcher::Dispatcher;
use crate::verbs::RdmaDevice;

/// The bundle of collaborator handles every socket, manager, and listener
/// carries: the native CM provider, the transport device, the completion
/// dispatcher, and the layer configuration.
pub struct RdmaEnv {
    pub provider: Arc<dyn CmProvider>,
    pub device: Arc<dyn RdmaDevice>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub config: RdmaCmConfig,
}

impl RdmaEnv {
    pub fn new(
        provider: Arc<dyn CmProvider>,
        device: Arc<dyn RdmaDevice>,
        dispatcher: Arc<dyn Dispatcher>,
        config: RdmaCmConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            device,
            dispatcher,
            config,
        })
    }
}
