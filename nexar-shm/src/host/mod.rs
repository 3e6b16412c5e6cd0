//! Services the engine consumes from its host runtime.

pub mod adapter;
pub mod local;
pub mod rcache;
pub mod xmem;

use std::sync::Arc;

pub use adapter::{Bootstrap, Fallback, HostReducer, Reducer};
pub use local::{LocalPeer, LocalWorld, SyntheticTopology};
pub use rcache::RegistrationCache;
#[cfg(target_os = "linux")]
pub use xmem::ProcessVm;
pub use xmem::{AccessToken, CrossMemory, Mapping, PeerId, SameAddressSpace, XmemFeatures};

use crate::flag::Progress;

/// Everything the engine needs from the host, bundled per participant.
#[derive(Clone)]
pub struct HostServices {
    pub bootstrap: Arc<dyn Bootstrap>,
    pub fallback: Arc<dyn Fallback>,
    pub xmem: Arc<dyn CrossMemory>,
    pub reducer: Arc<dyn Reducer>,
    pub progress: Arc<dyn Progress>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("rank", &self.bootstrap.rank())
            .field("world_size", &self.bootstrap.world_size())
            .field("xmem", &self.xmem.features())
            .finish_non_exhaustive()
    }
}
