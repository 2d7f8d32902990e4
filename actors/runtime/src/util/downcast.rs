// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_hamt::Error as HamtError;
use fvm_shared::error::ExitCode;

use crate::ActorError;

/// Trait to allow multiple error types to be able to be downcasted into an `ActorError`.
pub trait ActorDowncast {
    /// Downcast a dynamic std Error into an `ActorError`. If the error cannot be downcasted
    /// into an ActorError automatically, use the provided `ExitCode` to generate a new error.
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError;

    /// Wrap the error with a message, without overwriting an exit code.
    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error;
}

impl ActorDowncast for anyhow::Error {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        match downcast_util(self) {
            Ok(actor_error) => actor_error.wrap(msg),
            Err(other) => {
                ActorError::unchecked(default_exit_code, format!("{}: {}", msg.as_ref(), other))
            }
        }
    }
    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        match downcast_util(self) {
            Ok(actor_error) => actor_error.wrap(msg).into(),
            Err(other) => anyhow!("{}: {}", msg.as_ref(), other),
        }
    }
}

impl ActorDowncast for AmtError {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        match self {
            AmtError::Dynamic(e) => e.downcast_default(default_exit_code, msg),
            other => {
                ActorError::unchecked(default_exit_code, format!("{}: {}", msg.as_ref(), other))
            }
        }
    }
    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        match self {
            AmtError::Dynamic(e) => e.downcast_wrap(msg),
            other => anyhow!("{}: {}", msg.as_ref(), other),
        }
    }
}

impl ActorDowncast for HamtError {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        match self {
            HamtError::Dynamic(e) => e.downcast_default(default_exit_code, msg),
            other => {
                ActorError::unchecked(default_exit_code, format!("{}: {}", msg.as_ref(), other))
            }
        }
    }
    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        match self {
            HamtError::Dynamic(e) => e.downcast_wrap(msg),
            other => anyhow!("{}: {}", msg.as_ref(), other),
        }
    }
}

/// Attempts to downcast a `Box<dyn std::error::Error>` into an actor error.
/// Returns `Ok` with the actor error if it can be downcast automatically
/// and returns `Err` with the original error if it cannot.
fn downcast_util(error: anyhow::Error) -> anyhow::Result<ActorError> {
    // Check if error is ActorError, return as such
    let error = match error.downcast::<ActorError>() {
        Ok(actor_err) => return Ok(actor_err),
        Err(other) => other,
    };

    // Errors raised inside AMT and HAMT callbacks are boxed as dynamic errors.
    let error = match error.downcast::<AmtError>() {
        Ok(AmtError::Dynamic(e)) => return downcast_util(e),
        Ok(other) => return Err(anyhow::Error::from(other)),
        Err(other) => other,
    };

    match error.downcast::<HamtError>() {
        Ok(HamtError::Dynamic(e)) => downcast_util(e),
        Ok(other) => Err(anyhow::Error::from(other)),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor_error;

    #[test]
    fn wrap_preserves_embedded_actor_error() {
        let err: anyhow::Error = actor_error!(illegal_argument; "sector 4 not live").into();
        let wrapped = err.downcast_wrap("failed to terminate");
        let actor_err = wrapped.downcast::<ActorError>().unwrap();
        assert_eq!(ExitCode::USR_ILLEGAL_ARGUMENT, actor_err.exit_code());
        assert_eq!("failed to terminate: sector 4 not live", actor_err.msg());
    }

    #[test]
    fn default_code_applies_to_untyped_errors() {
        let err = anyhow!("block missing").downcast_default(ExitCode::USR_ILLEGAL_STATE, "load");
        assert_eq!(ExitCode::USR_ILLEGAL_STATE, err.exit_code());
        assert_eq!("load: block missing", err.msg());
    }

    #[test]
    fn errors_from_amt_callbacks_are_unwrapped() {
        let inner: anyhow::Error = actor_error!(not_found; "no partition 2").into();
        let err = AmtError::Dynamic(inner).downcast_default(ExitCode::USR_ILLEGAL_STATE, "iterate");
        assert_eq!(ExitCode::USR_NOT_FOUND, err.exit_code());
    }
}
