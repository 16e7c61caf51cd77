//! TOTP (Time-based One-Time Password) helpers
//!
//! Secret generation, code verification and enrollment artifacts compatible
//! with Google Authenticator, Authy, and other TOTP apps.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

// =============================================================================
// Constants
// =============================================================================

/// TOTP code length (standard is 6 digits)
pub const TOTP_DIGITS: usize = 6;

/// Time step in seconds (standard is 30 seconds)
pub const TOTP_STEP: u64 = 30;

/// Issuer name shown in authenticator apps
pub const TOTP_ISSUER: &str = "Stratix";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("Invalid TOTP secret")]
    InvalidSecret,
    #[error("Failed to create TOTP instance")]
    Creation,
    #[error("Failed to generate QR code")]
    QrGeneration,
}

// =============================================================================
// Code Format & Window
// =============================================================================

/// Whether `code` is exactly six ASCII digits.
///
/// Checked before any remote verification so malformed input never spends a
/// verification attempt.
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == TOTP_DIGITS && code.bytes().all(|b| b.is_ascii_digit())
}

/// Seconds left in the current 30 second window at `now_secs`.
///
/// For countdown display only; verification tolerance never depends on it.
pub fn time_remaining_in_window(now_secs: u64) -> u64 {
    TOTP_STEP - (now_secs % TOTP_STEP)
}

fn unix_now() -> Result<u64, TotpError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TotpError::Creation)
}

// =============================================================================
// TOTP Operations
// =============================================================================

/// Generate a new TOTP secret (base32 encoded)
pub fn generate_secret() -> String {
    let secret = Secret::generate_secret();
    secret.to_encoded().to_string()
}

/// Create a TOTP instance for verification
pub fn create_totp(secret: &str, account: &str) -> Result<TOTP, TotpError> {
    let secret_bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|_| TotpError::InvalidSecret)?;

    TOTP::new(
        Algorithm::SHA1, // SHA1 is standard for TOTP compatibility
        TOTP_DIGITS,
        1, // skew: allow 1 step before/after for clock drift
        TOTP_STEP,
        secret_bytes,
        Some(TOTP_ISSUER.to_string()),
        account.to_string(),
    )
    .map_err(|_| TotpError::Creation)
}

/// Verify a TOTP code against a secret using constant-time comparison
pub fn verify_code(secret: &str, code: &str, account: &str) -> Result<bool, TotpError> {
    verify_code_at(secret, code, account, unix_now()?)
}

/// Verify a TOTP code as of `time` (unix seconds)
pub fn verify_code_at(
    secret: &str,
    code: &str,
    account: &str,
    time: u64,
) -> Result<bool, TotpError> {
    let totp = create_totp(secret, account)?;

    if !is_well_formed_code(code) {
        return Ok(false);
    }

    // skew=1 means we check time-30s, time, time+30s
    let time_steps = [
        time.saturating_sub(TOTP_STEP),
        time,
        time.saturating_add(TOTP_STEP),
    ];

    let code_bytes = code.as_bytes();

    for time_step in time_steps {
        let expected_code = totp.generate(time_step);
        let expected_bytes = expected_code.as_bytes();
        if code_bytes.len() == expected_bytes.len() && code_bytes.ct_eq(expected_bytes).into() {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Generate the current TOTP code
pub fn generate_current_code(secret: &str, account: &str) -> Result<String, TotpError> {
    let totp = create_totp(secret, account)?;
    Ok(totp.generate(unix_now()?))
}

// =============================================================================
// Enrollment Artifacts
// =============================================================================

/// Generate QR code as base64 PNG data URL
pub fn generate_qr_code(secret: &str, account: &str) -> Result<String, TotpError> {
    let uri = get_otpauth_uri(secret, account)?;

    let qr = qrcode::QrCode::new(uri.as_bytes()).map_err(|_| TotpError::QrGeneration)?;
    let qr_image = qr.render::<image::Luma<u8>>().build();

    let dynamic_image = image::DynamicImage::ImageLuma8(qr_image);
    let mut png_data = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut png_data);
    dynamic_image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|_| TotpError::QrGeneration)?;

    Ok(format!("data:image/png;base64,{}", BASE64.encode(&png_data)))
}

/// Get the otpauth URI for manual entry
pub fn get_otpauth_uri(secret: &str, account: &str) -> Result<String, TotpError> {
    let totp = create_totp(secret, account)?;
    Ok(totp.get_url())
}

// =============================================================================
// Token Generation
// =============================================================================

/// Generate a random opaque token
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Tests
// =============================================================================
