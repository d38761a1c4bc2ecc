// Cooloff gate: caps how often a reactive fleet policy may fire.

use tracing::trace;

/// A countdown gate that allows an action at most once per `limit` ticks.
///
/// The gate starts open. [`Cooloff::fire`] closes it and restarts the
/// countdown; once [`Cooloff::tick`] has been called `limit` times the gate
/// opens again.
#[derive(Debug, Clone)]
pub struct Cooloff {
    name: &'static str,
    limit: u32,
    remaining: u32,
    armed: bool,
}

impl Cooloff {
    pub fn new(name: &'static str, limit: u32) -> Self {
        Self {
            name,
            limit,
            remaining: 0,
            armed: false,
        }
    }

    /// Advances the countdown by one step, reopening the gate when it runs out.
    pub fn tick(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.armed = false;
        }
        trace!(
            gate = self.name,
            remaining = self.remaining,
            armed = self.armed,
            "Cooloff tick"
        );
    }

    /// Returns `true` and arms the countdown if the gate is open.
    pub fn fire(&mut self) -> bool {
        if self.armed {
            trace!(gate = self.name, remaining = self.remaining, "Cooloff still cooling");
            return false;
        }
        self.armed = true;
        self.remaining = self.limit;
        trace!(gate = self.name, remaining = self.remaining, "Cooloff fired");
        true
    }

    pub fn is_open(&self) -> bool {
        !self.armed
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
