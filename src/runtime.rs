//! Arm runtime: ingress/egress health tracking and guardrail mode
//! arbitration.
//!
//! When the ingress arm is degraded or down and the deployment opts in,
//! the gateway runs `egress_only`: ingress checks are skipped while
//! egress enforcement stays live. Mode transitions are counted.

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ArmSettings;
use crate::models::Mode;
use crate::observability::metrics::{arm_mode_gauge, arm_status_gauge, arm_transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmProbeState {
    Up,
    Degraded,
    Down,
}

impl ArmProbeState {
    fn as_str(&self) -> &'static str {
        match self {
            ArmProbeState::Up => "up",
            ArmProbeState::Degraded => "degraded",
            ArmProbeState::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArmStatus {
    pub state: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArmSnapshot {
    pub mode: String,
    pub ingress: ArmStatus,
    pub egress: ArmStatus,
    pub ingress_degradation_reason: String,
}

#[derive(Debug, Default)]
struct ProbeState {
    queue_lag_ms: Option<f64>,
    forced: Option<(ArmProbeState, String)>,
}

struct ArmState {
    probe: ProbeState,
    mode: Mode,
    last_reason: String,
}

pub struct ArmRuntime {
    settings: ArmSettings,
    state: Mutex<ArmState>,
}

impl ArmRuntime {
    pub fn new(settings: ArmSettings) -> Self {
        let runtime = Self {
            settings,
            state: Mutex::new(ArmState {
                probe: ProbeState::default(),
                mode: Mode::Normal,
                last_reason: String::new(),
            }),
        };
        runtime.evaluate_mode();
        runtime
    }

    /// Force the ingress probe (admin/tests). `None` clears the override.
    pub fn force_ingress(&self, state: Option<ArmProbeState>, reason: Option<&str>) {
        let mut guard = self.state.lock();
        guard.probe.forced = state.map(|s| (s, reason.unwrap_or("").to_string()));
    }

    pub fn record_ingress_queue_lag(&self, lag_ms: Option<f64>) {
        self.state.lock().probe.queue_lag_ms = lag_ms;
    }

    fn probe_status(&self, probe: &ProbeState) -> (ArmProbeState, String) {
        if let Some((state, reason)) = &probe.forced {
            let default_reason = match state {
                ArmProbeState::Down => "ingress arm forced down",
                ArmProbeState::Degraded => "ingress arm forced degraded",
                ArmProbeState::Up => "",
            };
            let reason = if reason.is_empty() {
                default_reason.to_string()
            } else {
                reason.clone()
            };
            return (*state, reason);
        }
        if let Some(lag) = probe.queue_lag_ms {
            if lag > self.settings.ingress_degraded_lag_ms {
                return (
                    ArmProbeState::Degraded,
                    format!(
                        "ingress queue lag {}ms > {}ms",
                        lag as i64, self.settings.ingress_degraded_lag_ms as i64
                    ),
                );
            }
        }
        (ArmProbeState::Up, String::new())
    }

    /// Recompute the current mode, counting transitions.
    pub fn evaluate_mode(&self) -> Mode {
        let mut guard = self.state.lock();

        let (ingress_state, reason) = if self.settings.ingress_enabled {
            self.probe_status(&guard.probe)
        } else {
            (ArmProbeState::Down, "ingress arm disabled".to_string())
        };
        let degraded = ingress_state != ArmProbeState::Up;

        let target = if degraded
            && self.settings.egress_only_on_ingress_degraded
            && self.settings.egress_enabled
        {
            Mode::EgressOnly
        } else {
            Mode::Normal
        };

        if target != guard.mode {
            arm_transition(guard.mode.as_str(), target.as_str());
            guard.mode = target;
        }
        guard.last_reason = reason;

        let egress_state = if self.settings.egress_enabled {
            ArmProbeState::Up
        } else {
            ArmProbeState::Down
        };
        for state in [ArmProbeState::Up, ArmProbeState::Degraded, ArmProbeState::Down] {
            arm_status_gauge("ingress", state.as_str(), ingress_state == state);
            arm_status_gauge("egress", state.as_str(), egress_state == state);
        }
        for mode in [Mode::Normal, Mode::EgressOnly] {
            arm_mode_gauge(mode.as_str(), guard.mode == mode);
        }
        guard.mode
    }

    pub fn mode(&self) -> Mode {
        self.evaluate_mode()
    }

    pub fn is_ingress_degraded(&self) -> bool {
        self.evaluate_mode();
        let guard = self.state.lock();
        !guard.last_reason.is_empty()
            || guard.mode == Mode::EgressOnly
            || !self.settings.ingress_enabled
    }

    pub fn snapshot(&self) -> ArmSnapshot {
        let mode = self.evaluate_mode();
        let guard = self.state.lock();
        let (ingress_state, ingress_reason) = if self.settings.ingress_enabled {
            self.probe_status(&guard.probe)
        } else {
            (ArmProbeState::Down, "ingress arm disabled".to_string())
        };
        let (egress_state, egress_reason) = if self.settings.egress_enabled {
            (ArmProbeState::Up, "enabled".to_string())
        } else {
            (ArmProbeState::Down, "egress arm disabled".to_string())
        };
        ArmSnapshot {
            mode: mode.as_str().to_string(),
            ingress: ArmStatus {
                state: ingress_state.as_str().to_string(),
                reason: if ingress_reason.is_empty() {
                    "healthy".to_string()
                } else {
                    ingress_reason
                },
            },
            egress: ArmStatus {
                state: egress_state.as_str().to_string(),
                reason: egress_reason,
            },
            ingress_degradation_reason: guard.last_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ArmSettings {
        ArmSettings {
            ingress_enabled: true,
            egress_enabled: true,
            egress_only_on_ingress_degraded: true,
            ingress_degraded_lag_ms: 2_000.0,
        }
    }

    #[test]
    fn test_starts_normal() {
        let arm = ArmRuntime::new(settings());
        assert_eq!(arm.mode(), Mode::Normal);
        assert!(!arm.is_ingress_degraded());
    }

    #[test]
    fn test_forced_degraded_switches_to_egress_only() {
        let arm = ArmRuntime::new(settings());
        arm.force_ingress(Some(ArmProbeState::Degraded), Some("test override"));
        assert_eq!(arm.mode(), Mode::EgressOnly);
        assert!(arm.is_ingress_degraded());
        let snap = arm.snapshot();
        assert_eq!(snap.mode, "egress_only");
        assert_eq!(snap.ingress.state, "degraded");
    }

    #[test]
    fn test_clearing_force_returns_to_normal() {
        let arm = ArmRuntime::new(settings());
        arm.force_ingress(Some(ArmProbeState::Down), None);
        assert_eq!(arm.mode(), Mode::EgressOnly);
        arm.force_ingress(None, None);
        assert_eq!(arm.mode(), Mode::Normal);
    }

    #[test]
    fn test_queue_lag_triggers_degradation() {
        let arm = ArmRuntime::new(settings());
        arm.record_ingress_queue_lag(Some(5_000.0));
        assert_eq!(arm.mode(), Mode::EgressOnly);
        arm.record_ingress_queue_lag(Some(100.0));
        assert_eq!(arm.mode(), Mode::Normal);
    }

    #[test]
    fn test_opt_out_keeps_normal_mode() {
        let mut s = settings();
        s.egress_only_on_ingress_degraded = false;
        let arm = ArmRuntime::new(s);
        arm.force_ingress(Some(ArmProbeState::Degraded), None);
        assert_eq!(arm.mode(), Mode::Normal);
    }

    #[test]
    fn test_egress_disabled_cannot_enter_egress_only() {
        let mut s = settings();
        s.egress_enabled = false;
        let arm = ArmRuntime::new(s);
        arm.force_ingress(Some(ArmProbeState::Down), None);
        assert_eq!(arm.mode(), Mode::Normal);
        assert_eq!(arm.snapshot().egress.state, "down");
    }
}
