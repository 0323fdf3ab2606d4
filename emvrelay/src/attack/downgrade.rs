use log::{debug, trace};

use super::AUTH_DOWNGRADE;
use crate::apdu::ApduMessage;
use crate::error::Result;
use crate::kernel::{AipLayout, AipView, AuthMethod};
use crate::relay::{InterceptContext, Interceptor};
use crate::tlv::tags;

pub(super) const NAME: &str = "auth_downgrade";

/// Rewrites the AIP of a GPO response so that the card appears to support a single,
/// weaker authentication method. Bits outside the scheme's authentication masks are
/// left as they are.
pub struct AuthDowngrade {
    forced_method: AuthMethod,
    fallback_layout: AipLayout,
}

impl AuthDowngrade {
    pub fn new(forced_method: AuthMethod) -> AuthDowngrade {
        AuthDowngrade {
            forced_method,
            fallback_layout: AipLayout::default(),
        }
    }
}

impl Interceptor for AuthDowngrade {
    fn name(&self) -> &str {
        NAME
    }

    fn intercept(&self, message: ApduMessage, context: &mut InterceptContext) -> Result<ApduMessage> {
        if !AUTH_DOWNGRADE.applies(&message, context.session.state) {
            return Ok(message);
        }
        // a synthesized response carries the target scheme's own AIP
        if context.kernel_switched() {
            trace!("Kernel switched in this pass, AIP left as synthesized");
            return Ok(message);
        }

        let layout = context
            .active_kernel()
            .map_or(&self.fallback_layout, |profile| &profile.aip_layout);
        let view = match AipView::from_message(&message, layout) {
            Some(view) => view,
            None => {
                trace!("GPO response without a two byte AIP");
                return Ok(message);
            }
        };

        if !view.methods().iter().any(|method| *method != self.forced_method) {
            trace!(
                "AIP {:02X?} already announces {} only",
                view.bytes(),
                self.forced_method
            );
            return Ok(message);
        }

        let downgraded = layout.with_only(view.bytes(), self.forced_method);
        debug!(
            "Session {}: AIP {:02X?} -> {:02X?} ({:?} -> {})",
            context.session.session_id,
            view.bytes(),
            downgraded,
            view.methods(),
            self.forced_method
        );

        message.with(tags::AIP, downgraded.to_vec())
    }
}
