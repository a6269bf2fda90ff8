//! ## Device state machine
//!
//! Lifecycle and recovery: `Closed -> Idle -> {Writing,
//! Reading, Aborting, Clearing} -> Idle`, with any protocol violation
//! routing to `Halted` until a successful `INITIATE_CLEAR`. `device.rs`
//! holds the single [`State`] cell behind the device mutex and calls into
//! this module's recovery functions; this module never touches bulk
//! endpoints directly except through [`UsbTransport`] and `control.rs`.

use std::time::Duration;

use crate::constants::misc;
use crate::control;
use crate::error::{Error, Result};
use crate::quirks::{AbortRecoveryPolicy, QuirksRecord};
use crate::transport::UsbTransport;
use crate::types::{BTagCounter, Endpoints};

/// Where a device handle currently sits in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Idle,
    Writing,
    Reading,
    Aborting,
    Clearing,
    Halted,
}

/// Which direction a transaction being recovered was using, so abort
/// recovery calls the matching `INITIATE_ABORT_BULK_{OUT,IN}` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// The settled state after abort recovery, plus whether the bTag counter
/// must be reset — true only when the `reopen` policy fired (spec.md §4.4
/// step 4: "releases the interface, re-claims it, and resets bTag").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortOutcome {
    pub state: State,
    pub reset_b_tag: bool,
}

/// Run abort recovery for a transaction that failed by timeout, bTag
/// mismatch, or cancellation. Returns the
/// state the handle should settle into.
pub fn recover_abort(
    transport: &mut dyn UsbTransport,
    endpoints: &Endpoints,
    b_tag: u8,
    direction: Direction,
    quirks: &QuirksRecord,
    interface_number: u8,
    io_timeout: Duration,
) -> Result<AbortOutcome> {
    let endpoint = match direction {
        Direction::Out => endpoints.bulk_out.address,
        Direction::In => endpoints.bulk_in.address,
    };

    tracing::warn!(b_tag, ?direction, "entering abort recovery");

    let initiate = match direction {
        Direction::Out => control::initiate_abort_bulk_out(transport, endpoint, b_tag, io_timeout),
        Direction::In => control::initiate_abort_bulk_in(transport, endpoint, b_tag, io_timeout),
    };

    let outcome = match initiate {
        Ok(control::Status::Success) | Ok(control::Status::Pending) => {
            let check = match direction {
                Direction::Out => control::check_abort_bulk_out_status(
                    transport,
                    endpoint,
                    io_timeout * misc::CLEAR_STATUS_TIMEOUT_MULTIPLE,
                    io_timeout,
                ),
                Direction::In => control::check_abort_bulk_in_status(
                    transport,
                    endpoint,
                    io_timeout * misc::CLEAR_STATUS_TIMEOUT_MULTIPLE,
                    io_timeout,
                ),
            };
            match check {
                Ok(_) => {
                    transport.clear_halt(endpoint)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Ok(control::Status::TransferNotInProgress) => Ok(()),
        Ok(_) | Err(_) => Err(Error::DeviceStatusFailed("INITIATE_ABORT")),
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(b_tag, "abort recovery succeeded");
            Ok(AbortOutcome { state: State::Idle, reset_b_tag: false })
        }
        Err(_) => apply_abort_recovery_policy(
            transport,
            endpoints,
            quirks,
            interface_number,
            io_timeout,
        ),
    }
}

fn apply_abort_recovery_policy(
    transport: &mut dyn UsbTransport,
    endpoints: &Endpoints,
    quirks: &QuirksRecord,
    interface_number: u8,
    io_timeout: Duration,
) -> Result<AbortOutcome> {
    match quirks.abort_recovery_policy {
        AbortRecoveryPolicy::Spec => {
            tracing::error!("abort recovery failed; handle moves to Halted");
            Ok(AbortOutcome { state: State::Halted, reset_b_tag: false })
        }
        AbortRecoveryPolicy::Clear => {
            tracing::warn!("abort recovery failed; quirk escalates to full clear");
            match recover_clear(transport, endpoints, interface_number, io_timeout) {
                Ok(()) => Ok(AbortOutcome { state: State::Idle, reset_b_tag: true }),
                Err(_) => Ok(AbortOutcome { state: State::Halted, reset_b_tag: false }),
            }
        }
        AbortRecoveryPolicy::Reopen => {
            tracing::warn!("abort recovery failed; quirk escalates to reopen");
            transport.release_interface(interface_number)?;
            transport.claim_interface(interface_number)?;
            Ok(AbortOutcome { state: State::Idle, reset_b_tag: true })
        }
    }
}

/// INITIATE_CLEAR -> poll CHECK_CLEAR_STATUS -> clear-halt both bulk
/// endpoints -> caller resets the bTag counter (spec.md §4.4 "Clear
/// recovery"). The 10x I/O timeout poll bound is SPEC_FULL.md §F.2's
/// resolution of the "indefinite PENDING" open question.
pub fn recover_clear(
    transport: &mut dyn UsbTransport,
    endpoints: &Endpoints,
    interface_number: u8,
    io_timeout: Duration,
) -> Result<()> {
    control::initiate_clear(
        transport,
        interface_number,
        io_timeout * misc::CLEAR_STATUS_TIMEOUT_MULTIPLE,
        io_timeout,
    )?;
    transport.clear_halt(endpoints.bulk_out.address)?;
    transport.clear_halt(endpoints.bulk_in.address)?;
    Ok(())
}

/// Reset the bTag counter, as required after `open` and after every
/// successful `INITIATE_CLEAR`.
pub fn reset_b_tag(b_tag: &mut BTagCounter) {
    b_tag.reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_distinct() {
        assert_ne!(State::Idle, State::Halted);
        assert_ne!(State::Writing, State::Reading);
    }
}
