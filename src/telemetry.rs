// # Synthetic Field-Trial Reporting
//
// A pure mapping from the build-flag and feature state to experiment group
// labels, so field data can be correlated with the configuration that was
// actually *effective* rather than the one requested. The asymmetry in the
// fallback column is load-bearing: the fallback classifier treats the
// 2-way and 3-way split modes as BRP-on, while the primary classifier
// treats only full enablement as on.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrpMode {
    Disabled,
    Enabled,
    DisabledBut2WaySplit,
    DisabledBut3WaySplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrpProcesses {
    BrowserOnly,
    BrowserAndRenderer,
    NonRenderer,
    AllProcesses,
}

impl BrpProcesses {
    fn label(self) -> &'static str {
        match self {
            BrpProcesses::BrowserOnly => "BrowserOnly",
            BrpProcesses::BrowserAndRenderer => "BrowserAndRenderer",
            BrpProcesses::NonRenderer => "NonRenderer",
            BrpProcesses::AllProcesses => "AllProcesses",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrpSlotLayout {
    /// Ref count in the previous slot's tail.
    PrevSlot,
    /// Ref count before the allocation.
    BeforeAlloc,
}

/// Runtime trial state feeding the mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrialState {
    pub pcscan_enabled: bool,
    /// Whether this build can run the scanner at all.
    pub pa_allow_pcscan: bool,
    /// The assigned BRP group, if the process is in one.
    pub brp_group: Option<(BrpMode, BrpProcesses)>,
    pub brp_slot_layout: BrpSlotLayout,
}

pub const TRIAL_BACKUP_REF_PTR: &str = "BackupRefPtr_Effective";
pub const TRIAL_PCSCAN: &str = "PCScan_Effective";
pub const TRIAL_PCSCAN_FALLBACK: &str = "PCScan_Effective_Fallback";

fn brp_effectively_on(mode: BrpMode, for_fallback: bool) -> bool {
    match mode {
        BrpMode::Enabled => true,
        // The fallback classifier only recognizes full disablement; the
        // split modes count as BRP-on there.
        BrpMode::DisabledBut2WaySplit | BrpMode::DisabledBut3WaySplit => for_fallback,
        BrpMode::Disabled => false,
    }
}

fn pcscan_label(state: &TrialState, for_fallback: bool) -> String {
    if state.pcscan_enabled {
        return if state.pa_allow_pcscan {
            "Enabled".to_string()
        } else {
            "Unavailable".to_string()
        };
    }
    if let Some((mode, _)) = state.brp_group {
        if brp_effectively_on(mode, for_fallback) {
            return "Ignore_BRPIsOn".to_string();
        }
    }
    if state.pa_allow_pcscan {
        "Disabled".to_string()
    } else {
        "Unavailable".to_string()
    }
}

fn brp_label(state: &TrialState) -> String {
    if state.pcscan_enabled {
        return "Ignore_PCScanIsOn".to_string();
    }
    match state.brp_group {
        None => "Ignore_NoGroup".to_string(),
        Some((BrpMode::Enabled, processes)) => {
            let layout = match state.brp_slot_layout {
                BrpSlotLayout::PrevSlot => "PrevSlot",
                BrpSlotLayout::BeforeAlloc => "BeforeAlloc",
            };
            format!("Enabled{}_{}", layout, processes.label())
        }
        Some((BrpMode::DisabledBut2WaySplit, processes)) => {
            format!("DisabledBut2WaySplit_{}", processes.label())
        }
        Some((BrpMode::DisabledBut3WaySplit, processes)) => {
            format!("DisabledBut3WaySplit_{}", processes.label())
        }
        Some((BrpMode::Disabled, _)) => "Disabled".to_string(),
    }
}

/// Produces the synthetic trial groups for the given state. Pure; the
/// caller owns emission.
pub fn synthetic_field_groups(state: &TrialState) -> Vec<(&'static str, String)> {
    vec![
        (TRIAL_BACKUP_REF_PTR, brp_label(state)),
        (TRIAL_PCSCAN, pcscan_label(state, false)),
        (TRIAL_PCSCAN_FALLBACK, pcscan_label(state, true)),
    ]
}
