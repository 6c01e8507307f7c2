/// Connectivity as inferred by the remote store and reported to listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has finished yet. Cached results are held back
    /// until the state is known.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl OnlineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineState::Unknown => "Unknown",
            OnlineState::Online => "Online",
            OnlineState::Offline => "Offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Unknown" => Some(OnlineState::Unknown),
            "Online" => Some(OnlineState::Online),
            "Offline" => Some(OnlineState::Offline),
            _ => None,
        }
    }
}
