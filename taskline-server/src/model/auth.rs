//! Session tokens
//!
//! Session tokens are issued and verified by the service itself. A token has a structure of
//! `{header}.{claims}.{signature}`, where every segment is encoded with unpadded base64url. Header
//! and claims are JSON objects, and the signature is a HMAC-SHA256 of `{header}.{claims}` keyed
//! with the service secret.
//!
//! Tokens are self-contained - there is no storage of issued tokens, and no way to revoke them.
//! The `exp` claim is the only way a token stops being valid.

use std::time::Duration;

use base64::prelude::*;
use chrono::{DateTime, TimeDelta, Utc};
use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::prelude::Type;
use thiserror::Error;

use crate::model::users::UserId;

type HmacSha256 = Hmac<Sha256>;

/// The only signing algorithm tokens are issued with
const ALGORITHM: &str = "HS256";

/// Token type put in the header
const TOKEN_TYPE: &str = "JWT";

/// Token verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    MalformedToken(&'static str),
    #[error("Token signature doesn't match")]
    BadSignature,
    #[error("Token expired")]
    ExpiredToken,
}

/// User role carried by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize, Default)]
#[sqlx(rename_all = "PascalCase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Authenticated identity derived from a verified token
///
/// Lives only as long as the request or connection it was derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user
    pub id: UserId,
    /// Role of the user at the moment the token was issued
    pub role: Role,
}

/// Token header. Always the same for tokens issued by this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            alg: ALGORITHM.to_owned(),
            typ: TOKEN_TYPE.to_owned(),
        }
    }
}

/// Session token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User authorized by this token
    pub sub: UserId,
    /// User email at the issue time
    pub email: String,
    /// User role
    pub role: Role,
    /// Expiration as epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// Claims for the user. Expiration is assigned while issuing.
    pub fn new(sub: UserId, email: impl Into<String>, role: Role) -> Self {
        Self {
            sub,
            email: email.into(),
            role,
            exp: None,
        }
    }
}

/// Newtype for session token string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Token split into its parts
///
/// Produced by a single parsing step, so there is no partially parsed token. The signature is
/// not verified at this point - the claims are not to be trusted before `TokenCodec` checks it.
#[derive(Debug)]
struct UntrustedToken<'a> {
    /// `{header}.{claims}` part that the signature is computed over
    signed: &'a str,
    /// Decoded header
    header: Header,
    /// Decoded claims
    claims: Claims,
    /// Encoded signature
    signature: &'a str,
}

impl<'a> UntrustedToken<'a> {
    fn parse(token: &'a str) -> Result<Self, TokenError> {
        let mut segments = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::MalformedToken("expected three segments"));
        };

        let signed = &token[..header.len() + 1 + claims.len()];

        Ok(Self {
            signed,
            header: decode_segment(header)?,
            claims: decode_segment(claims)?,
            signature,
        })
    }
}

/// Decodes base64url encoded JSON segment
fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let data = BASE64_URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::MalformedToken("segment is not base64url"))?;
    serde_json::from_slice(&data).map_err(|_| TokenError::MalformedToken("segment is not JSON"))
}

/// Encodes serializable value as base64url JSON segment
fn encode_segment(value: &impl Serialize) -> Result<String> {
    let data = serde_json::to_vec(value)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(data))
}

/// Issues and verifies session tokens
#[derive(Clone)]
pub struct TokenCodec {
    /// HMAC state keyed with the service secret, cloned for every signature
    mac: HmacSha256,
    /// How long issued tokens are valid
    ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Creates codec signing with the given secret
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self> {
        let secret = secret.as_ref();
        ensure!(!secret.is_empty(), "Token secret cannot be empty");

        Ok(Self {
            mac: HmacSha256::new_from_slice(secret).map_err(|err| eyre!("Invalid token secret: {err}"))?,
            ttl,
        })
    }

    /// Issues a token valid for the codec `ttl` from now
    pub fn issue(&self, claims: Claims) -> Result<SessionToken> {
        self.issue_at(claims, Utc::now())
    }

    /// Issues a token as if it was issued at `now`
    ///
    /// Any `exp` on the passed claims is overwritten.
    pub fn issue_at(&self, mut claims: Claims, now: DateTime<Utc>) -> Result<SessionToken> {
        let expires_at = now + TimeDelta::from_std(self.ttl)?;
        claims.exp = Some(expires_at.timestamp());

        let header = encode_segment(&Header::default())?;
        let claims = encode_segment(&claims)?;
        let signed = format!("{header}.{claims}");

        let signature = self.sign(&signed).finalize().into_bytes();
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);

        Ok(SessionToken(format!("{signed}.{signature}")))
    }

    /// Verifies token, returning the identity it was issued for
    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Verifies token as if it was verified at `now`
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, TokenError> {
        let token = UntrustedToken::parse(token)?;
        if token.header.alg != ALGORITHM {
            return Err(TokenError::MalformedToken("unsupported algorithm"));
        }

        // Canonical encoding is enforced by the decoder, so any change to the signature segment
        // either fails to decode or decodes to different bytes.
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(token.signature)
            .map_err(|_| TokenError::BadSignature)?;
        self.sign(token.signed)
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims = token.claims;
        if let Some(exp) = claims.exp
            && exp <= now.timestamp()
        {
            return Err(TokenError::ExpiredToken);
        }

        Ok(Identity {
            id: claims.sub,
            role: claims.role,
        })
    }

    /// HMAC state fed with the signed part of the token
    fn sign(&self, signed: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(signed.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "TasklineTestTokenSecret";

    fn codec() -> TokenCodec {
        TokenCodec::new(SECRET, Duration::from_secs(24 * 3600)).unwrap()
    }

    fn claims(role: Role) -> Claims {
        Claims::new(UserId::new(), "user@example.com", role)
    }

    /// Replaces single segment of the token
    fn replace_segment(token: &SessionToken, idx: usize, segment: &str) -> String {
        let mut segments: Vec<_> = token.as_str().split('.').collect();
        segments[idx] = segment;
        segments.join(".")
    }

    mod issue {
        use super::*;

        #[test]
        fn verify_issued_token() {
            let codec = codec();

            for role in [Role::User, Role::Admin] {
                let claims = claims(role);
                let token = codec.issue(claims.clone()).unwrap();
                let identity = codec.verify(token.as_str()).unwrap();

                assert_eq!(
                    identity,
                    Identity {
                        id: claims.sub,
                        role
                    }
                );
            }
        }

        #[test]
        fn token_has_three_unpadded_segments() {
            let token = codec().issue(claims(Role::User)).unwrap();

            let segments: Vec<_> = token.as_str().split('.').collect();
            assert_eq!(segments.len(), 3);
            assert!(!token.as_str().contains('='));
            assert!(!token.as_str().contains('+'));
            assert!(!token.as_str().contains('/'));
        }

        #[test]
        fn expiration_follows_ttl() {
            let codec = TokenCodec::new(SECRET, Duration::from_secs(60)).unwrap();
            let now = Utc::now();
            let token = codec.issue_at(claims(Role::User), now).unwrap();

            let segments: Vec<_> = token.as_str().split('.').collect();
            let claims: Claims = decode_segment(segments[1]).unwrap();
            assert_eq!(claims.exp, Some(now.timestamp() + 60));

            let header: Header = decode_segment(segments[0]).unwrap();
            assert_eq!(header, Header::default());
        }

        #[test]
        fn empty_secret_rejected() {
            let _ = TokenCodec::new("", Duration::from_secs(60)).unwrap_err();
        }
    }

    mod verify {
        use super::*;

        #[test]
        fn flipped_signature_byte_fails() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();
            let signature = token.as_str().split('.').nth(2).unwrap().to_owned();

            for idx in 0..signature.len() {
                let mut flipped = signature.clone().into_bytes();
                flipped[idx] ^= 0x01;
                let flipped = String::from_utf8(flipped).unwrap();

                let tampered = replace_segment(&token, 2, &flipped);
                assert_eq!(
                    codec.verify(&tampered),
                    Err(TokenError::BadSignature),
                    "signature byte {idx}"
                );
            }
        }

        #[test]
        fn truncated_or_extended_signature_fails() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();
            let signature = token.as_str().split('.').nth(2).unwrap();

            let truncated = replace_segment(&token, 2, &signature[..signature.len() - 4]);
            assert_eq!(codec.verify(&truncated), Err(TokenError::BadSignature));

            let extended = replace_segment(&token, 2, &format!("{signature}AAAA"));
            assert_eq!(codec.verify(&extended), Err(TokenError::BadSignature));

            let empty = replace_segment(&token, 2, "");
            assert_eq!(codec.verify(&empty), Err(TokenError::BadSignature));
        }

        #[test]
        fn forged_claims_fail() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();

            let mut forged = claims(Role::Admin);
            forged.exp = Some(Utc::now().timestamp() + 3600);
            let forged = encode_segment(&forged).unwrap();

            let tampered = replace_segment(&token, 1, &forged);
            assert_eq!(codec.verify(&tampered), Err(TokenError::BadSignature));
        }

        #[test]
        fn other_secret_fails() {
            let token = codec().issue(claims(Role::User)).unwrap();
            let other = TokenCodec::new("OtherSecret", Duration::from_secs(24 * 3600)).unwrap();

            assert_eq!(other.verify(token.as_str()), Err(TokenError::BadSignature));
        }

        #[test]
        fn expired_token_fails() {
            let codec = TokenCodec::new(SECRET, Duration::from_secs(60)).unwrap();
            let now = Utc::now();
            let token = codec.issue_at(claims(Role::User), now).unwrap();

            codec
                .verify_at(token.as_str(), now + TimeDelta::seconds(59))
                .unwrap();

            // Expiration instant itself is already past validity
            assert_eq!(
                codec.verify_at(token.as_str(), now + TimeDelta::seconds(60)),
                Err(TokenError::ExpiredToken)
            );
            assert_eq!(
                codec.verify_at(token.as_str(), now + TimeDelta::hours(1)),
                Err(TokenError::ExpiredToken)
            );
        }

        #[test]
        fn token_without_expiration_accepted() {
            let codec = codec();
            let claims = claims(Role::User);

            let header = encode_segment(&Header::default()).unwrap();
            let payload = encode_segment(&claims).unwrap();
            let signed = format!("{header}.{payload}");
            let signature =
                BASE64_URL_SAFE_NO_PAD.encode(codec.sign(&signed).finalize().into_bytes());

            let identity = codec.verify(&format!("{signed}.{signature}")).unwrap();
            assert_eq!(identity.id, claims.sub);
        }

        #[test]
        fn wrong_segments_count_is_malformed() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();
            let segments: Vec<_> = token.as_str().split('.').collect();

            for malformed in [
                String::new(),
                "fake_token".to_owned(),
                segments[..2].join("."),
                format!("{}.extra", token.as_str()),
            ] {
                assert!(
                    matches!(
                        codec.verify(&malformed),
                        Err(TokenError::MalformedToken(_))
                    ),
                    "{malformed:?}"
                );
            }
        }

        #[test]
        fn undecodable_claims_are_malformed() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();

            let not_base64 = replace_segment(&token, 1, "not*base64");
            assert_eq!(
                codec.verify(&not_base64),
                Err(TokenError::MalformedToken("segment is not base64url"))
            );

            let not_json = replace_segment(&token, 1, &BASE64_URL_SAFE_NO_PAD.encode("not json"));
            assert_eq!(
                codec.verify(&not_json),
                Err(TokenError::MalformedToken("segment is not JSON"))
            );
        }

        #[test]
        fn other_algorithm_is_malformed() {
            let codec = codec();
            let token = codec.issue(claims(Role::User)).unwrap();

            let header = encode_segment(&Header {
                alg: "none".to_owned(),
                typ: TOKEN_TYPE.to_owned(),
            })
            .unwrap();
            let tampered = replace_segment(&token, 0, &header);

            assert_eq!(
                codec.verify(&tampered),
                Err(TokenError::MalformedToken("unsupported algorithm"))
            );
        }
    }
}
