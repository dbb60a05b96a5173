use serde::Serialize;
use shared::{BookingId, Location, PeerCommand, RelayEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Joined,
    Streaming,
    Idle,
    Reconnecting { attempt: u32 },
    Disconnected,
}

impl Phase {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Joined | Self::Streaming | Self::Idle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    AwaitingDispatch,
    Acknowledged { message: String },
}

impl DispatchStatus {
    pub fn label(&self) -> &str {
        match self {
            Self::AwaitingDispatch => "Awaiting dispatch",
            Self::Acknowledged { message } => message,
        }
    }
}

/// What a screen needs to render the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub booking_id: BookingId,
    #[serde(flatten)]
    pub phase: Phase,
    pub remote_location: Option<Location>,
    pub dispatch: DispatchStatus,
    pub sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Absent,
    Active,
    Paused,
    Exhausted,
}

/// Transport-free state of one tracking session.
///
/// Every transition returns the command (if any) the caller must put on the
/// wire, so the machine can be driven by a socket or by a test.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    booking_id: BookingId,
    phase: Phase,
    remote_location: Option<Location>,
    dispatch: DispatchStatus,
    sent: u64,
    source: SourceState,
}

impl TrackingSession {
    pub fn new(booking_id: BookingId, has_source: bool) -> Self {
        Self {
            booking_id,
            phase: Phase::Connecting,
            remote_location: None,
            dispatch: DispatchStatus::AwaitingDispatch,
            sent: 0,
            source: if has_source {
                SourceState::Active
            } else {
                SourceState::Absent
            },
        }
    }

    pub fn booking_id(&self) -> &BookingId {
        &self.booking_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remote_location(&self) -> Option<Location> {
        self.remote_location
    }

    pub fn dispatch(&self) -> &DispatchStatus {
        &self.dispatch
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }

    /// Transport is up. Joins the room and picks up streaming where it was
    /// left before any reconnect.
    pub fn on_connected(&mut self) -> PeerCommand {
        self.phase = match self.source {
            SourceState::Absent => Phase::Joined,
            SourceState::Active => Phase::Streaming,
            SourceState::Paused | SourceState::Exhausted => Phase::Idle,
        };
        PeerCommand::JoinBooking {
            booking_id: self.booking_id.clone(),
        }
    }

    pub fn on_transport_lost(&mut self) {
        self.phase = match self.phase {
            Phase::Disconnected => Phase::Disconnected,
            Phase::Reconnecting { attempt } => Phase::Reconnecting {
                attempt: attempt.saturating_add(1),
            },
            _ => Phase::Reconnecting { attempt: 1 },
        };
    }

    pub fn location_fix(&mut self, location: Location) -> Option<PeerCommand> {
        if !self.is_streaming() || !location.is_finite() {
            return None;
        }
        self.sent += 1;
        Some(PeerCommand::SendLocation {
            booking_id: self.booking_id.clone(),
            location,
        })
    }

    pub fn source_exhausted(&mut self) {
        self.source = SourceState::Exhausted;
        if self.phase == Phase::Streaming {
            self.phase = Phase::Idle;
        }
    }

    pub fn pause(&mut self) -> bool {
        if self.source != SourceState::Active {
            return false;
        }
        self.source = SourceState::Paused;
        if self.phase == Phase::Streaming {
            self.phase = Phase::Idle;
        }
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.source != SourceState::Paused {
            return false;
        }
        self.source = SourceState::Active;
        if self.phase == Phase::Idle {
            self.phase = Phase::Streaming;
        }
        true
    }

    /// Apply a pushed event. Returns whether anything visible changed.
    pub fn on_event(&mut self, event: RelayEvent) -> bool {
        if self.phase == Phase::Disconnected {
            return false;
        }
        match event {
            RelayEvent::ReceiveLocation {
                booking_id,
                location,
            } => {
                if booking_id != self.booking_id || !location.is_finite() {
                    return false;
                }
                self.remote_location = Some(location);
                true
            }
            RelayEvent::ReceiveAck {
                booking_id,
                message,
                ..
            } => {
                if booking_id != self.booking_id {
                    return false;
                }
                // one-shot: the first acknowledgement sticks
                if self.dispatch != DispatchStatus::AwaitingDispatch {
                    return false;
                }
                self.dispatch = DispatchStatus::Acknowledged { message };
                true
            }
            RelayEvent::Unknown => false,
        }
    }

    pub fn acknowledge(&self, message: Option<String>) -> Option<PeerCommand> {
        if !self.phase.is_connected() {
            return None;
        }
        Some(PeerCommand::SendAck {
            booking_id: self.booking_id.clone(),
            message,
        })
    }

    /// End the session. Yields a `leave_booking` when the room is still
    /// joined so the relay can release it without waiting for the close.
    pub fn close(&mut self) -> Option<PeerCommand> {
        let was_connected = self.phase.is_connected();
        self.phase = Phase::Disconnected;
        was_connected.then(|| PeerCommand::LeaveBooking {
            booking_id: self.booking_id.clone(),
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            booking_id: self.booking_id.clone(),
            phase: self.phase,
            remote_location: self.remote_location,
            dispatch: self.dispatch.clone(),
            sent: self.sent,
        }
    }
}
