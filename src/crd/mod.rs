pub mod memcached;
pub mod resources;

pub use memcached::{
    ConditionStatus, ConditionType, DockerImage, Memcached, MemcachedCondition,
    MemcachedSpec, MemcachedStatus, ProgressState, ProxySpec, VerboseLevel,
};
pub use resources::{ResourceDescription, Resources};
