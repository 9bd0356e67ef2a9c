//! Credit-based flow control. Inbound channel data accrues debt; once a
//! channel's outstanding debt reaches the high watermark and no suppress
//! flag is set, the controller emits a grant returning the debt to zero.
//! Backpressure, visibility and offline transitions gate grants and
//! surface policy diagnostics.

use std::collections::HashMap;

use mana_common::DiagnosticRecord;

use crate::control::FlowGrant;

#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    /// Debt level at which a credit grant fires; also the buffered-bytes
    /// level at which the transport counts as backpressured.
    pub high_water_mark: u64,
    /// Buffered-bytes level below which backpressure clears.
    pub low_water_mark: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            high_water_mark: 256 * 1024,
            low_water_mark: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCredit {
    /// Bytes consumed since the last grant.
    pub credit_outstanding: u64,
    /// Total credit granted over the channel's lifetime.
    pub credit_granted: u64,
    pub last_grant_at: u64,
}

/// Result of a state transition: grants to send and diagnostics to emit.
#[derive(Debug, Default)]
pub struct FlowUpdate {
    pub grants: Vec<FlowGrant>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

#[derive(Debug)]
pub struct FlowController {
    config: FlowConfig,
    transport_backpressured: bool,
    visibility_hidden: bool,
    offline: bool,
    channels: HashMap<u32, ChannelCredit>,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        FlowController {
            config,
            transport_backpressured: false,
            visibility_hidden: false,
            offline: false,
            channels: HashMap::new(),
        }
    }

    pub fn channel(&self, id: u32) -> Option<&ChannelCredit> {
        self.channels.get(&id)
    }

    pub fn suppressed(&self) -> bool {
        self.transport_backpressured || self.visibility_hidden || self.offline
    }

    /// Account inbound channel data; returns a grant when the debt
    /// crosses the threshold and nothing suppresses it.
    pub fn on_inbound_data(&mut self, id: u32, len: usize, now: u64) -> Option<FlowGrant> {
        let entry = self.channels.entry(id).or_default();
        entry.credit_outstanding += len as u64;
        self.maybe_grant(id, now)
    }

    fn maybe_grant(&mut self, id: u32, now: u64) -> Option<FlowGrant> {
        if self.suppressed() {
            return None;
        }
        let entry = self.channels.get_mut(&id)?;
        if entry.credit_outstanding < self.config.high_water_mark {
            return None;
        }
        let credit = u32::try_from(entry.credit_outstanding).unwrap_or(u32::MAX);
        entry.credit_outstanding -= u64::from(credit);
        entry.credit_granted += u64::from(credit);
        entry.last_grant_at = now;
        trace!(channel = id, credit, "credit grant");
        Some(FlowGrant { id, credit })
    }

    /// Re-check every channel after a suppress flag clears.
    fn release_deferred(&mut self, now: u64) -> Vec<FlowGrant> {
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.maybe_grant(id, now))
            .collect()
    }

    pub fn set_transport_backpressured(&mut self, on: bool, now: u64) -> FlowUpdate {
        let mut update = FlowUpdate::default();
        if self.transport_backpressured == on {
            return update;
        }
        self.transport_backpressured = on;
        update.diagnostics.push(DiagnosticRecord::info(
            "buffer_state",
            if on { "high" } else { "recovered" },
        ));
        if !on {
            update.grants = self.release_deferred(now);
        }
        update
    }

    pub fn set_visibility_hidden(&mut self, hidden: bool, now: u64) -> FlowUpdate {
        let mut update = FlowUpdate::default();
        if self.visibility_hidden == hidden {
            return update;
        }
        self.visibility_hidden = hidden;
        update.diagnostics.push(DiagnosticRecord::info(
            "visibility",
            if hidden { "hidden" } else { "visible" },
        ));
        if !hidden {
            update.grants = self.release_deferred(now);
        }
        update
    }

    pub fn set_offline(&mut self, offline: bool, now: u64) -> FlowUpdate {
        let mut update = FlowUpdate::default();
        if self.offline == offline {
            return update;
        }
        self.offline = offline;
        update.diagnostics.push(DiagnosticRecord::info(
            "connectivity",
            if offline { "offline" } else { "online" },
        ));
        if !offline {
            update.grants = self.release_deferred(now);
        }
        update
    }

    /// Sample the carrier's buffered outbound byte count against the
    /// watermarks.
    pub fn note_buffered(&mut self, buffered: u64, now: u64) -> FlowUpdate {
        if buffered >= self.config.high_water_mark && !self.transport_backpressured {
            self.set_transport_backpressured(true, now)
        } else if buffered < self.config.low_water_mark && self.transport_backpressured {
            self.set_transport_backpressured(false, now)
        } else {
            FlowUpdate::default()
        }
    }
}
