/// Bit-set describing at which granularities a peer is local to this
/// participant.
///
/// Named bits mirror hardware scopes. Bits from [`Locality::VIRTUAL_START`]
/// upward are assigned by the hierarchy builder to user-defined groupings
/// (rank lists, split or capped levels) and only ever appear in the
/// builder's own view of its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Locality(pub u32);

impl Locality {
    pub const NONE: Locality = Locality(0);
    pub const NODE: Locality = Locality(1 << 0);
    pub const SOCKET: Locality = Locality(1 << 1);
    pub const NUMA: Locality = Locality(1 << 2);
    pub const L3CACHE: Locality = Locality(1 << 3);
    pub const L2CACHE: Locality = Locality(1 << 4);
    pub const L1CACHE: Locality = Locality(1 << 5);
    pub const CORE: Locality = Locality(1 << 6);
    pub const HWTHREAD: Locality = Locality(1 << 7);

    /// Every named scope; what a participant reports for itself.
    pub const ALL_NAMED: Locality = Locality(0xFF);

    pub const VIRTUAL_START: u32 = 16;
    pub const VIRTUAL_BITS: u32 = 16;

    /// Mask of every virtual bit.
    pub const ALL_VIRTUAL: Locality =
        Locality(((1u32 << Self::VIRTUAL_BITS) - 1) << Self::VIRTUAL_START);

    /// The `idx`-th virtual locality bit.
    pub const fn virtual_bit(idx: u32) -> Locality {
        Locality(1 << (Self::VIRTUAL_START + idx))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_virtual(self) -> bool {
        self.0 >= (1 << Self::VIRTUAL_START)
    }

    /// `true` iff every bit of `other` is set in `self`.
    pub const fn contains(self, other: Locality) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Locality) -> Locality {
        Locality(self.0 | other.0)
    }

    pub const fn intersection(self, other: Locality) -> Locality {
        Locality(self.0 & other.0)
    }

    pub const fn without(self, other: Locality) -> Locality {
        Locality(self.0 & !other.0)
    }

    /// Resolve a scope name as accepted in hierarchy strings.
    pub fn from_name(name: &str) -> Option<Locality> {
        let loc = match name.to_ascii_lowercase().as_str() {
            "node" | "flat" => Self::NODE,
            "socket" => Self::SOCKET,
            "numa" => Self::NUMA,
            "l3" | "l3cache" => Self::L3CACHE,
            "l2" | "l2cache" => Self::L2CACHE,
            "l1" | "l1cache" => Self::L1CACHE,
            "core" => Self::CORE,
            "hwthread" | "thread" => Self::HWTHREAD,
            _ => return None,
        };
        Some(loc)
    }
}

impl std::ops::BitOr for Locality {
    type Output = Locality;

    fn bitor(self, rhs: Locality) -> Locality {
        self.union(rhs)
    }
}

impl std::ops::BitAnd for Locality {
    type Output = Locality;

    fn bitand(self, rhs: Locality) -> Locality {
        self.intersection(rhs)
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::NODE => "node",
            Self::SOCKET => "socket",
            Self::NUMA => "numa",
            Self::L3CACHE => "l3cache",
            Self::L2CACHE => "l2cache",
            Self::L1CACHE => "l1cache",
            Self::CORE => "core",
            Self::HWTHREAD => "hwthread",
            _ => return write!(f, "0x{:08x}", self.0),
        };
        f.write_str(name)
    }
}
