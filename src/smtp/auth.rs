//! AUTH support
//!
//! There is no user database. The gate either accepts anything (permissive
//! mode) or compares what the client sent with the single configured
//! username and password.

use crate::config::SmtpConfig;
use crate::smtp::error::SmtpError;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::str::FromStr;

/// Base64 of "Username:"
pub const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// Base64 of "Password:"
pub const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl FromStr for Mechanism {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Mechanism::Plain),
            "LOGIN" => Ok(Mechanism::Login),
            _ => Err(SmtpError::AuthMechanism(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Pass/fail decision for `AUTH`, derived from the configuration
#[derive(Debug, Clone)]
pub struct AuthGate {
    permissive: bool,
    expected: Option<Credentials>,
}

impl AuthGate {
    pub fn from_config(config: &SmtpConfig) -> Self {
        let expected = config
            .auth_mode
            .requires_credentials()
            .then(|| Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            });

        Self {
            permissive: config.allow_insecure_auth,
            expected,
        }
    }

    /// Whether `AUTH` is advertised and accepted at all
    pub fn is_offered(&self) -> bool {
        self.permissive || self.expected.is_some()
    }

    pub fn verify(&self, credentials: &Credentials) -> Result<(), SmtpError> {
        if self.permissive {
            return Ok(());
        }
        match &self.expected {
            Some(expected) if expected == credentials => Ok(()),
            Some(_) => Err(SmtpError::AuthFailed),
            None => Err(SmtpError::AuthUnsupported),
        }
    }
}

/// Decode an `AUTH PLAIN` response: base64 of `authzid NUL user NUL password`
pub fn decode_plain(encoded: &str) -> Result<Credentials, SmtpError> {
    let decoded = decode_base64(encoded)?;
    let mut fields = decoded.split(|&b| b == 0);

    let (Some(_authzid), Some(username), Some(password), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(SmtpError::InvalidSyntax(
            "malformed PLAIN credentials".to_owned(),
        ));
    };

    Ok(Credentials {
        username: String::from_utf8_lossy(username).into_owned(),
        password: String::from_utf8_lossy(password).into_owned(),
    })
}

/// Decode one `AUTH LOGIN` answer
pub fn decode_login_field(encoded: &str) -> Result<String, SmtpError> {
    decode_base64(encoded).map(|field| String::from_utf8_lossy(&field).into_owned())
}

/// Collect credentials for `mechanism`. `challenge` sends a 334 prompt and
/// returns the client's next line.
pub fn exchange<F>(
    mechanism: Mechanism,
    initial: Option<&str>,
    mut challenge: F,
) -> Result<Credentials, SmtpError>
where
    F: FnMut(&str) -> Result<String, SmtpError>,
{
    match mechanism {
        Mechanism::Plain => {
            let response = match initial {
                // "=" is an empty initial response
                Some(initial) if initial != "=" => initial.to_owned(),
                _ => challenge("")?,
            };
            decode_plain(&response)
        }
        Mechanism::Login => {
            let username = match initial {
                Some(initial) => decode_login_field(initial)?,
                None => decode_login_field(&challenge(USERNAME_PROMPT)?)?,
            };
            let password = decode_login_field(&challenge(PASSWORD_PROMPT)?)?;
            Ok(Credentials { username, password })
        }
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, SmtpError> {
    let encoded = encoded.trim();
    if encoded == "*" {
        return Err(SmtpError::InvalidSyntax("authentication cancelled".to_owned()));
    }
    STANDARD
        .decode(encoded)
        .map_err(|_| SmtpError::InvalidSyntax("invalid base64 in AUTH exchange".to_owned()))
}
