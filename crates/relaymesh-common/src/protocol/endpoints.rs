/// The endpoint set the router itself serves, dispatched as a tagged enum
/// rather than by string comparison at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Worker-initiated advertise of one or more services.
    Ad,
    /// Worker-initiated unadvertise.
    Unad,
    /// Router-to-router fan-out form of advertise.
    RelayAd,
    /// Router-to-router fan-out form of unadvertise.
    RelayUnad,
    /// Resolve a service name to its live worker peers.
    Discover,
    /// Forwarded form of `Discover`, served by an exit node; never re-forwards.
    DiscoverAffine,
    /// Control endpoint: list known circuits and their health.
    Circuits,
}

impl Endpoint {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ad" => Some(Endpoint::Ad),
            "unad" => Some(Endpoint::Unad),
            "relay-ad" => Some(Endpoint::RelayAd),
            "relay-unad" => Some(Endpoint::RelayUnad),
            "discover" => Some(Endpoint::Discover),
            "discover-affine" => Some(Endpoint::DiscoverAffine),
            "circuits" => Some(Endpoint::Circuits),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Ad => "ad",
            Endpoint::Unad => "unad",
            Endpoint::RelayAd => "relay-ad",
            Endpoint::RelayUnad => "relay-unad",
            Endpoint::Discover => "discover",
            Endpoint::DiscoverAffine => "discover-affine",
            Endpoint::Circuits => "circuits",
        }
    }
}
