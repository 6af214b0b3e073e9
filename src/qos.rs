//! Quality-of-service levels.
//!
//! Each QoS level selects an independent worker group with its own
//! thread pool, ready queue and monitor policy. `inherit`/`default`
//! travel as negative sentinels at the API boundary and get normalized
//! to a concrete level before touching any per-QoS array, which is
//! exactly what [`QoS::normalize`] does.

use crate::error::{FlowrtError, FlowrtResult};

/// Number of concrete (non-sentinel) QoS levels.
pub const QOS_LEVELS: usize = 6;

/// Sentinel: inherit the QoS of the enclosing queue/task.
pub const QOS_INHERIT: i32 = -1;
/// Sentinel: use the process-wide default QoS.
pub const QOS_DEFAULT_SENTINEL: i32 = -2;

/// A concrete, normalized QoS level.
///
/// Ordered lowest-to-highest so `qos_a < qos_b` matches "less
/// preferential" exactly as the worker-group hierarchy expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    Background = 0,
    Utility = 1,
    Default = 2,
    UserInitiated = 3,
    DeadlineRequest = 4,
    UserInteractive = 5,
}

impl QoS {
    pub const MIN: QoS = QoS::Background;
    pub const MAX: QoS = QoS::UserInteractive;

    /// Index into a `[T; QOS_LEVELS]` per-QoS array.
    pub fn index(self) -> usize {
        self as u8 as usize
    }

    pub fn from_index(idx: usize) -> Option<QoS> {
        match idx {
            0 => Some(QoS::Background),
            1 => Some(QoS::Utility),
            2 => Some(QoS::Default),
            3 => Some(QoS::UserInitiated),
            4 => Some(QoS::DeadlineRequest),
            5 => Some(QoS::UserInteractive),
            _ => None,
        }
    }

    /// Normalize a raw external QoS value, resolving the
    /// `inherit`/`default` sentinels against a `fallback` (the queue's
    /// own QoS for task submission, or the process default for queue
    /// creation). Rejects anything else out of `[Background,
    /// UserInteractive]` as `InvalidArgument`.
    pub fn normalize(raw: i32, fallback: QoS) -> FlowrtResult<QoS> {
        if raw == QOS_INHERIT || raw == QOS_DEFAULT_SENTINEL {
            return Ok(fallback);
        }
        QoS::from_index(raw as usize).ok_or_else(|| {
            FlowrtError::invalid_argument(format!("qos value {raw} out of range"))
        })
    }

    pub fn iter_all() -> impl Iterator<Item = QoS> {
        (0..QOS_LEVELS).map(|i| QoS::from_index(i).unwrap())
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::Default
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QoS::Background => "background",
            QoS::Utility => "utility",
            QoS::Default => "default",
            QoS::UserInitiated => "user_initiated",
            QoS::DeadlineRequest => "deadline_request",
            QoS::UserInteractive => "user_interactive",
        };
        write!(f, "{name}")
    }
}

/// A fixed-size map keyed by QoS level.
#[derive(Debug, Clone)]
pub struct PerQos<T>([T; QOS_LEVELS]);

impl<T> PerQos<T> {
    pub fn new(values: [T; QOS_LEVELS]) -> Self {
        Self(values)
    }

    pub fn from_fn(mut f: impl FnMut(QoS) -> T) -> Self {
        Self(std::array::from_fn(|i| f(QoS::from_index(i).unwrap())))
    }

    pub fn get(&self, qos: QoS) -> &T {
        &self.0[qos.index()]
    }

    pub fn get_mut(&mut self, qos: QoS) -> &mut T {
        &mut self.0[qos.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (QoS, &T)> {
        self.0.iter().enumerate().map(|(i, v)| (QoS::from_index(i).unwrap(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_sentinels() {
        assert_eq!(QoS::normalize(QOS_INHERIT, QoS::UserInteractive).unwrap(), QoS::UserInteractive);
        assert_eq!(QoS::normalize(QOS_DEFAULT_SENTINEL, QoS::Background).unwrap(), QoS::Background);
    }

    #[test]
    fn normalize_concrete() {
        assert_eq!(QoS::normalize(0, QoS::Default).unwrap(), QoS::Background);
        assert_eq!(QoS::normalize(5, QoS::Default).unwrap(), QoS::UserInteractive);
    }

    #[test]
    fn normalize_out_of_range() {
        assert!(QoS::normalize(6, QoS::Default).is_err());
        assert!(QoS::normalize(-3, QoS::Default).is_err());
    }

    #[test]
    fn ordering() {
        assert!(QoS::Background < QoS::UserInteractive);
        assert!(QoS::UserInitiated > QoS::Utility);
    }
}
