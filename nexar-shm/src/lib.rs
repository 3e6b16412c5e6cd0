pub mod bootstrap;
pub mod collective;
pub mod comm;
pub mod config;
pub mod context;
pub mod error;
pub mod flag;
pub mod group;
pub mod host;
pub mod pipeline;
pub mod protocol;
pub mod reduce;
pub mod shm;
pub mod topology;
pub mod types;

pub use bootstrap::form_shm_comm;
pub use collective::{
    hierarchical_allreduce, hierarchical_barrier, hierarchical_broadcast, hierarchical_reduce,
};
pub use comm::ShmComm;
pub use config::ShmConfig;
pub use context::GroupContext;
pub use error::{Result, ShmCommError};
pub use flag::{Progress, SeqFlag, Waiter, YieldProgress};
pub use host::{
    AccessToken, Bootstrap, CrossMemory, Fallback, HostReducer, HostServices, LocalPeer,
    LocalWorld, Mapping, PeerId, Reducer, RegistrationCache, SameAddressSpace,
    SyntheticTopology, XmemFeatures,
};
#[cfg(target_os = "linux")]
pub use host::ProcessVm;
pub use topology::{Hierarchy, Locality, LocalityDef, LocalitySource, LevelDef};
pub use types::{DataType, Rank, ReduceOp};
