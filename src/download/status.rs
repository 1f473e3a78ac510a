use std::fmt;

/// How a segment's transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    Success,
    Cancelled,
    /// A ranged request came back without an honoured `Content-Range`.
    RangeUnsupported,
    /// Retries exhausted. Carries the last HTTP status seen, if any.
    Failed(Option<u16>),
}

impl Terminal {
    pub fn is_failure(&self) -> bool {
        matches!(self, Terminal::Failed(_) | Terminal::RangeUnsupported)
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Success => f.write_str("success"),
            Terminal::Cancelled => f.write_str("cancelled"),
            Terminal::RangeUnsupported => f.write_str("range not supported"),
            Terminal::Failed(Some(code)) => write!(f, "failed (HTTP {code})"),
            Terminal::Failed(None) => f.write_str("failed"),
        }
    }
}

/// Segment lifecycle. Only moves forward; `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentStatus {
    WaitingStart,
    WaitingServer,
    Running,
    Finished(Terminal),
}

impl SegmentStatus {
    fn rank(&self) -> u8 {
        match self {
            SegmentStatus::WaitingStart => 0,
            SegmentStatus::WaitingServer => 1,
            SegmentStatus::Running => 2,
            SegmentStatus::Finished(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentStatus::Finished(_))
    }

    pub fn terminal(&self) -> Option<Terminal> {
        match self {
            SegmentStatus::Finished(terminal) => Some(*terminal),
            _ => None,
        }
    }

    /// True once `self` can no longer become `target`.
    pub fn is_past(&self, target: SegmentStatus) -> bool {
        if self.is_terminal() {
            return *self != target;
        }
        self.rank() > target.rank()
    }

    /// `WaitingServer` may be re-entered from `Running` when a retry reopens the stream.
    pub(crate) fn can_enter(&self, next: SegmentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (SegmentStatus::Running, SegmentStatus::WaitingServer) => true,
            (SegmentStatus::WaitingServer, SegmentStatus::WaitingServer) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentStatus::WaitingStart => f.write_str("waiting to start"),
            SegmentStatus::WaitingServer => f.write_str("waiting for server"),
            SegmentStatus::Running => f.write_str("running"),
            SegmentStatus::Finished(terminal) => terminal.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Waiting,
    Starting,
    Running,
    Success,
    Cancelled,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Success | ItemStatus::Cancelled | ItemStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Starting | ItemStatus::Running)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemStatus::Waiting => "waiting",
            ItemStatus::Starting => "starting",
            ItemStatus::Running => "running",
            ItemStatus::Success => "success",
            ItemStatus::Cancelled => "cancelled",
            ItemStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        let start = SegmentStatus::WaitingStart;
        assert!(start.can_enter(SegmentStatus::WaitingServer));
        assert!(start.can_enter(SegmentStatus::Finished(Terminal::Cancelled)));
        assert!(!SegmentStatus::Running.can_enter(SegmentStatus::WaitingStart));
        assert!(SegmentStatus::Running.can_enter(SegmentStatus::WaitingServer));
        let done = SegmentStatus::Finished(Terminal::Success);
        assert!(!done.can_enter(SegmentStatus::Finished(Terminal::Failed(None))));
    }

    #[test]
    fn past_detection() {
        let running = SegmentStatus::Running;
        assert!(running.is_past(SegmentStatus::WaitingServer));
        assert!(!running.is_past(SegmentStatus::Running));
        assert!(!running.is_past(SegmentStatus::Finished(Terminal::Success)));

        let failed = SegmentStatus::Finished(Terminal::Failed(Some(503)));
        assert!(failed.is_past(SegmentStatus::Finished(Terminal::Success)));
        assert!(!failed.is_past(SegmentStatus::Finished(Terminal::Failed(Some(503)))));
    }

    #[test]
    fn failure_keeps_http_code() {
        let status = Terminal::Failed(Some(404));
        assert!(status.is_failure());
        assert!(!Terminal::Cancelled.is_failure());
        assert_eq!(status.to_string(), "failed (HTTP 404)");
    }
}
