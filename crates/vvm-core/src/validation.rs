//! # Validation Module
//!
//! Checks applied to user input before it is spliced into a carrier command.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Host UI                                                      │
//! │  └── Basic format checks, immediate feedback                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── PIN digits and length                                             │
//! │  ├── Language code shape                                               │
//! │  └── No CR/LF or quotes that would break the command line              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Carrier server                                               │
//! │  └── Rejects with "password too weak", ... (see omtp::ChangePinResult)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use vvm_core::validation::{validate_pin, validate_language_code};
//!
//! validate_pin("1234", 4, 7).unwrap();
//! validate_language_code("es").unwrap();
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a voicemail PIN.
///
/// ## Rules
/// - Digits only
/// - Length within `min..=max` (OMTP carriers advertise this as `{min}-{max}`)
///
/// Server-side strength rules are not checked here; the server answers those.
pub fn validate_pin(pin: &str, min: usize, max: usize) -> ValidationResult<()> {
    if pin.is_empty() {
        return Err(ValidationError::Empty { field: "PIN" });
    }

    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PinNotNumeric);
    }

    let len = pin.len();
    if len < min || len > max {
        return Err(ValidationError::PinLength { len, min, max });
    }

    Ok(())
}

/// Validates an ISO 639 language code (`en`, `es`, `spa`).
pub fn validate_language_code(code: &str) -> ValidationResult<()> {
    let len = code.len();
    if !(2..=3).contains(&len) || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidLanguage(code.to_string()));
    }
    Ok(())
}

/// Rejects values that cannot be sent inside a single IMAP command line.
///
/// CR and LF would terminate the command early; a double quote would end a
/// quoted string.
pub fn validate_command_argument(field: &'static str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.contains(['\r', '\n', '"']) {
        return Err(ValidationError::UnsafeCommandArgument { field });
    }
    Ok(())
}
