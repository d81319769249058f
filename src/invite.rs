//! Stateless, signed room invitations.
//!
//! A token is `base64url(claims_json) + "." + hex(hmac)`, where the HMAC binds
//! the claim's `issued_at` to the encoded claims. Nothing is stored: validity
//! is recomputed from the signature, the clock and the caller's seat count.

use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::signature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomInviteClaims {
    pub guild_id: String,
    pub channel_id: String,
    pub role_id: String,
    pub creator_id: String,
    pub max_seats: u32,
    /// Unix seconds.
    pub issued_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InviteRequest {
    pub guild_id: String,
    pub channel_id: String,
    pub role_id: String,
    pub creator_id: String,
    pub max_seats: u32,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvite {
    pub token: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueError {
    NoSeats,
    NoLifetime,
}

impl fmt::Display for IssueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueError::NoSeats => write!(f, "max_seats must be at least 1"),
            IssueError::NoLifetime => write!(f, "expires_in_secs must be greater than 0"),
        }
    }
}

impl std::error::Error for IssueError {}

/// Why an invite was refused. Callers branch on [`InviteTokenError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteTokenError {
    Expired,
    Invalid,
    RoomFull,
}

impl InviteTokenError {
    pub fn code(&self) -> &'static str {
        match self {
            InviteTokenError::Expired => "TOKEN_EXPIRED",
            InviteTokenError::Invalid => "TOKEN_INVALID",
            InviteTokenError::RoomFull => "ROOM_FULL",
        }
    }
}

impl fmt::Display for InviteTokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InviteTokenError::Expired => write!(f, "this invite has expired"),
            InviteTokenError::Invalid => write!(f, "this invite is not valid"),
            InviteTokenError::RoomFull => write!(f, "this room is full"),
        }
    }
}

impl std::error::Error for InviteTokenError {}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Overrides the service clock.
    pub now_ms: Option<u64>,
    /// Seats currently taken in the room, known only to the caller.
    pub current_seat_count: Option<u32>,
}

pub struct RoomInviteTokenService {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl RoomInviteTokenService {
    pub fn new(secret: impl Into<Vec<u8>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            clock,
        }
    }

    pub fn create_token(&self, request: &InviteRequest) -> Result<IssuedInvite, IssueError> {
        if request.max_seats == 0 {
            return Err(IssueError::NoSeats);
        }
        if request.expires_in_secs == 0 {
            return Err(IssueError::NoLifetime);
        }

        let issued_at = self.clock.now_secs();
        let claims = RoomInviteClaims {
            guild_id: request.guild_id.clone(),
            channel_id: request.channel_id.clone(),
            role_id: request.role_id.clone(),
            creator_id: request.creator_id.clone(),
            max_seats: request.max_seats,
            issued_at,
            expires_at: issued_at.saturating_add(request.expires_in_secs),
        };

        // Field order of the struct fixes the key order of the JSON.
        let json = serde_json::to_vec(&claims).expect("invite claims always serialize");
        let payload = BASE64URL_NOPAD.encode(&json);
        let mac = signature::digest(&self.secret, issued_at, payload.as_bytes());
        let token = format!("{payload}.{}", HEXLOWER.encode(&mac));

        tracing::debug!(
            guild_id = %claims.guild_id,
            channel_id = %claims.channel_id,
            max_seats = claims.max_seats,
            expires_at = claims.expires_at,
            "issued room invite"
        );

        Ok(IssuedInvite {
            token,
            issued_at,
            expires_at: claims.expires_at,
        })
    }

    pub fn verify_token(
        &self,
        token: &str,
        options: VerifyOptions,
    ) -> Result<RoomInviteClaims, InviteTokenError> {
        let (payload, mac) = token.split_once('.').ok_or(InviteTokenError::Invalid)?;
        let json = BASE64URL_NOPAD
            .decode(payload.as_bytes())
            .map_err(|_| InviteTokenError::Invalid)?;
        let claims: RoomInviteClaims =
            serde_json::from_slice(&json).map_err(|_| InviteTokenError::Invalid)?;
        let mac = HEXLOWER
            .decode(mac.as_bytes())
            .map_err(|_| InviteTokenError::Invalid)?;
        signature::verify_digest(&self.secret, claims.issued_at, payload.as_bytes(), &mac)
            .map_err(|_| InviteTokenError::Invalid)?;

        if claims.max_seats == 0 || claims.expires_at <= claims.issued_at {
            return Err(InviteTokenError::Invalid);
        }

        let now_ms = options.now_ms.unwrap_or_else(|| self.clock.now_ms());
        if now_ms > claims.expires_at.saturating_mul(1000) {
            return Err(InviteTokenError::Expired);
        }

        if let Some(taken) = options.current_seat_count {
            if taken >= claims.max_seats {
                return Err(InviteTokenError::RoomFull);
            }
        }

        Ok(claims)
    }
}
