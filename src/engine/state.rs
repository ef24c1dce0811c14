//! Lifecycle states of an element

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a codec or sink instance
///
/// States are ordered: `Null < Ready < Paused < Playing`. A change of more
/// than one step is carried out one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Device closed, nothing held
    Null,
    /// Device open, no configuration applied
    Ready,
    /// Configuration negotiated, no buffers allocated
    Paused,
    /// Buffers allocated, streaming
    Playing,
}

impl StreamState {
    /// The neighbouring state one step closer to `target`
    pub fn step_toward(self, target: StreamState) -> Option<StreamState> {
        use StreamState::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less => Some(match self {
                Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            }),
            std::cmp::Ordering::Greater => Some(match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null => Null,
            }),
        }
    }

    /// Every intermediate state from `self` to `target`, excluding `self`
    pub fn path_to(self, target: StreamState) -> Vec<StreamState> {
        let mut path = Vec::new();
        let mut current = self;
        while let Some(next) = current.step_toward(target) {
            path.push(next);
            current = next;
        }
        path
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Null => write!(f, "null"),
            StreamState::Ready => write!(f, "ready"),
            StreamState::Paused => write!(f, "paused"),
            StreamState::Playing => write!(f, "playing"),
        }
    }
}

impl std::str::FromStr for StreamState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "null" => Ok(StreamState::Null),
            "ready" => Ok(StreamState::Ready),
            "paused" => Ok(StreamState::Paused),
            "playing" => Ok(StreamState::Playing),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_steps_through_intermediate_states() {
        use StreamState::*;
        assert_eq!(Null.path_to(Playing), vec![Ready, Paused, Playing]);
        assert_eq!(Playing.path_to(Null), vec![Paused, Ready, Null]);
        assert_eq!(Paused.path_to(Ready), vec![Ready]);
        assert!(Ready.path_to(Ready).is_empty());
    }

    #[test]
    fn test_parse_and_display() {
        for state in [
            StreamState::Null,
            StreamState::Ready,
            StreamState::Paused,
            StreamState::Playing,
        ] {
            assert_eq!(state.to_string().parse::<StreamState>().unwrap(), state);
        }
        assert!("stopped".parse::<StreamState>().is_err());
    }
}
