use log::{debug, warn};
use std::time::Duration;

use super::{StateConfusionSettings, STATE_CONFUSION};
use crate::apdu::{ApduMessage, CommandClass};
use crate::error::Result;
use crate::kernel::{build_response, TemplateContext};
use crate::relay::{InterceptContext, Interceptor};
use crate::{CryptogramType, Direction};

pub(super) const NAME: &str = "state_confusion";

/// Lets the ARQC through and races the issuer's answer with a forged offline TC.
pub struct StateConfusion {
    delay: Duration,
}

impl StateConfusion {
    pub fn new(settings: &StateConfusionSettings) -> StateConfusion {
        StateConfusion {
            delay: Duration::from_millis(settings.delay_ms),
        }
    }
}

impl Interceptor for StateConfusion {
    fn name(&self) -> &str {
        NAME
    }

    fn intercept(&self, message: ApduMessage, context: &mut InterceptContext) -> Result<ApduMessage> {
        let session = context.session;
        if !STATE_CONFUSION.applies(&message, session.state)
            || session.online_requested
            || message.cryptogram_type() != Some(CryptogramType::AuthorisationRequestCryptogram)
        {
            return Ok(message);
        }

        let profile = match context.active_kernel() {
            Some(profile) => profile.clone(),
            None => {
                warn!(
                    "Session {}: no kernel to shape a forged TC with",
                    session.session_id
                );
                return Ok(message);
            }
        };

        let template = TemplateContext {
            pan: session.pan.clone(),
            track2: session.track2.clone(),
            atc: message.atc().or(session.atc).unwrap_or_default(),
            aip: None,
            cryptogram_type: CryptogramType::TransactionCertificate,
            seed: session.session_id,
        };
        let forged = build_response(&profile, &template, CommandClass::GenerateAc)?;

        debug!(
            "Session {}: forged {} TC for ATC {:04X} in {:?}",
            session.session_id, profile.scheme_id, template.atc, self.delay
        );
        context.inject(self.delay, Direction::CardToTerminal, forged.to_bytes(), NAME);

        Ok(message)
    }
}
