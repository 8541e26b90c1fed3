//! External REST collaborators, consumed at their interface boundary only:
//! auth/session, profile (public-key publication), user and conversation
//! listings, message history, notification acknowledgement.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    protocol::{
        ChatMessage, ConversationSummary, Notification, NotificationListResponse, Paginated,
        TokenPair, UserProfile,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Serialize)]
struct OtpRequest<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp: Option<&'a str>,
    purpose: &'a str,
}

#[derive(Debug, Serialize)]
struct PasswordResetRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct PasswordResetConfirmRequest<'a> {
    email: &'a str,
    otp: &'a str,
    new_password: &'a str,
}

#[derive(Debug, Serialize)]
struct ProfileUpdateRequest<'a> {
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProfileUpdateResponse {
    user: UserProfile,
}

pub struct ChatApi {
    http: Client,
    base_url: String,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            http: Client::new(),
            base_url,
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        self.http
            .post(format!("{}/accounts/register/", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let tokens = self
            .http
            .post(format!("{}/accounts/login/", self.base_url))
            .json(&LoginRequest { email, password })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tokens)
    }

    pub async fn verify_otp(&self, email: &str, otp: &str, purpose: &str) -> Result<()> {
        self.http
            .post(format!("{}/accounts/verify-otp/", self.base_url))
            .json(&OtpRequest {
                email,
                otp: Some(otp),
                purpose,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn resend_otp(&self, email: &str, purpose: &str) -> Result<()> {
        self.http
            .post(format!("{}/accounts/resend-otp/", self.base_url))
            .json(&OtpRequest {
                email,
                otp: None,
                purpose,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn password_reset_request(&self, email: &str) -> Result<()> {
        self.http
            .post(format!("{}/accounts/password-reset/", self.base_url))
            .json(&PasswordResetRequest { email })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn password_reset_confirm(
        &self,
        email: &str,
        otp: &str,
        new_password: &str,
    ) -> Result<()> {
        self.http
            .post(format!("{}/accounts/password-reset/confirm/", self.base_url))
            .json(&PasswordResetConfirmRequest {
                email,
                otp,
                new_password,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn refresh_token(&self, refresh: &str) -> Result<TokenPair> {
        let tokens = self
            .http
            .post(format!("{}/accounts/token/refresh/", self.base_url))
            .json(&RefreshRequest { refresh })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tokens)
    }

    pub async fn profile(&self, access: &str) -> Result<UserProfile> {
        let profile = self
            .http
            .get(format!("{}/accounts/profile/", self.base_url))
            .bearer_auth(access)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(profile)
    }

    /// Publishes the local identity's public key on the profile.
    pub async fn publish_public_key(&self, access: &str, public_key: &str) -> Result<UserProfile> {
        let response: ProfileUpdateResponse = self
            .http
            .patch(format!("{}/accounts/profile/update/", self.base_url))
            .bearer_auth(access)
            .json(&ProfileUpdateRequest { public_key })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.user)
    }

    pub async fn users(&self, access: &str, page: u32) -> Result<Paginated<UserProfile>> {
        let listing = self
            .http
            .get(format!("{}/accounts/users/", self.base_url))
            .bearer_auth(access)
            .query(&[("page", page)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(listing)
    }

    pub async fn conversations(
        &self,
        access: &str,
        page: u32,
    ) -> Result<Paginated<ConversationSummary>> {
        let listing = self
            .http
            .get(format!("{}/chat/conversations/", self.base_url))
            .bearer_auth(access)
            .query(&[("page", page)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(listing)
    }

    pub async fn message_history(&self, access: &str, peer: UserId) -> Result<Vec<ChatMessage>> {
        let history = self
            .http
            .get(format!("{}/chat/history/{}/", self.base_url, peer.0))
            .bearer_auth(access)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(history)
    }

    pub async fn notifications(&self, access: &str) -> Result<Vec<Notification>> {
        let response: NotificationListResponse = self
            .http
            .get(format!("{}/notifications/", self.base_url))
            .bearer_auth(access)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.notifications)
    }

    pub async fn mark_notification_read(&self, access: &str, id: i64) -> Result<()> {
        self.http
            .post(format!("{}/notifications/{id}/read/", self.base_url))
            .bearer_auth(access)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn mark_all_notifications_seen(&self, access: &str) -> Result<()> {
        self.http
            .post(format!("{}/notifications/mark-all-seen/", self.base_url))
            .bearer_auth(access)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
