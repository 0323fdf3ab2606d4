use log::{debug, trace};
use std::sync::Arc;

use super::{CrossKernelSettings, CROSS_KERNEL_AT_GPO, CROSS_KERNEL_AT_READ_RECORD};
use crate::apdu::{ApduMessage, CommandClass};
use crate::error::{RelayError, Result};
use crate::kernel::{build_response, KernelProfile, KernelRegistry, TemplateContext};
use crate::relay::{InterceptContext, Interceptor};
use crate::CryptogramType;

pub(super) const NAME: &str = "cross_kernel";

/// Answers for the card with a response shaped by another scheme's kernel once the
/// transaction reaches the switch point.
pub struct CrossKernelSwitch {
    initial: Arc<KernelProfile>,
    target: Arc<KernelProfile>,
    switch_point: CommandClass,
}

impl CrossKernelSwitch {
    pub fn new(settings: &CrossKernelSettings, kernels: &KernelRegistry) -> Result<CrossKernelSwitch> {
        if !matches!(
            settings.switch_point,
            CommandClass::Gpo | CommandClass::ReadRecord
        ) {
            return Err(RelayError::Configuration(format!(
                "cross kernel switch at {:?} is not supported",
                settings.switch_point
            )));
        }

        let lookup = |scheme_id: &str| {
            kernels.get(scheme_id).map_err(|_| {
                RelayError::Configuration(format!(
                    "cross kernel switch refers to unknown scheme {}",
                    scheme_id
                ))
            })
        };
        let initial = lookup(&settings.initial_scheme)?;
        let target = lookup(&settings.target_scheme)?;

        if initial.scheme_id == target.scheme_id {
            return Err(RelayError::Configuration(
                "cross kernel switch needs two different schemes".to_string(),
            ));
        }

        Ok(CrossKernelSwitch {
            initial,
            target,
            switch_point: settings.switch_point,
        })
    }
}

impl Interceptor for CrossKernelSwitch {
    fn name(&self) -> &str {
        NAME
    }

    fn intercept(&self, message: ApduMessage, context: &mut InterceptContext) -> Result<ApduMessage> {
        let trigger = match self.switch_point {
            CommandClass::ReadRecord => CROSS_KERNEL_AT_READ_RECORD,
            _ => CROSS_KERNEL_AT_GPO,
        };
        if !trigger.applies(&message, context.session.state) {
            return Ok(message);
        }

        match context.active_kernel() {
            Some(active) if active.scheme_id == self.initial.scheme_id => (),
            other => {
                trace!(
                    "Not switching from {:?}",
                    other.map(|profile| profile.scheme_id.as_str())
                );
                return Ok(message);
            }
        }

        let session = context.session;
        let template = TemplateContext {
            pan: session.pan.clone(),
            track2: session.track2.clone(),
            atc: message.atc().or(session.atc).unwrap_or_default(),
            aip: None,
            cryptogram_type: CryptogramType::TransactionCertificate,
            seed: session.session_id,
        };
        let response = build_response(&self.target, &template, message.command_class())?;

        debug!(
            "Session {}: {:?} answered as {} instead of {}",
            session.session_id,
            message.command_class(),
            self.target.scheme_id,
            self.initial.scheme_id
        );
        context.switch_kernel(self.target.clone());

        Ok(response)
    }
}
