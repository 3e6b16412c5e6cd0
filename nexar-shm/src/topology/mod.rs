mod builder;
mod level;
mod locality;

pub use builder::{Hierarchy, build_hierarchy};
pub use level::{LevelDef, LocalityDef, LocalitySource, parse_hierarchy};
pub use locality::Locality;
