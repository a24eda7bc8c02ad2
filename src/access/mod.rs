//! Access control (C3): permission grants, share links, and invitations.
//!
//! [`PermissionChecker`] owns the raw per-(user, document) bitmask grants.
//! [`AccessController`] builds sharing and invitation workflows on top of it,
//! the way the original `access_control.py` builds on `permissions.py`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{CoreError, Result};

bitflags::bitflags! {
    /// Permission bitmask. `FULL` is the union of every non-owner bit plus
    /// `OWNER` itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u32 {
        const NONE = 0;
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const COMMENT = 1 << 2;
        const SHARE = 1 << 3;
        const ADMIN = 1 << 4;
        const OWNER = 1 << 5;
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::COMMENT.bits()
            | Self::SHARE.bits() | Self::ADMIN.bits() | Self::OWNER.bits();
    }
}

/// Roles map to a fixed permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Commenter,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn permissions(self) -> Permission {
        match self {
            Role::Viewer => Permission::READ,
            Role::Commenter => Permission::READ | Permission::COMMENT,
            Role::Editor => Permission::READ | Permission::COMMENT | Permission::WRITE,
            Role::Admin => Permission::READ | Permission::COMMENT | Permission::WRITE | Permission::SHARE | Permission::ADMIN,
            Role::Owner => Permission::FULL,
        }
    }
}

/// A single permission grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub user_id: String,
    pub document_id: String,
    pub permissions: Permission,
    pub granted_at: DateTime<Utc>,
    pub granted_by: String,
}

/// Result of [`PermissionChecker::check`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Tracks per-(user, document) permission grants and document owners.
pub struct PermissionChecker {
    grants: DashMap<(String, String), PermissionGrant>,
    document_grants: DashMap<String, Vec<String>>,
    owners: DashMap<String, String>,
    checks_performed: AtomicU64,
    checks_denied: AtomicU64,
}

impl PermissionChecker {
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
            document_grants: DashMap::new(),
            owners: DashMap::new(),
            checks_performed: AtomicU64::new(0),
            checks_denied: AtomicU64::new(0),
        }
    }

    pub async fn grant(
        &self,
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        permissions: Permission,
        granted_by: impl Into<String>,
    ) -> PermissionGrant {
        let user_id = user_id.into();
        let document_id = document_id.into();
        let grant = PermissionGrant {
            user_id: user_id.clone(),
            document_id: document_id.clone(),
            permissions,
            granted_at: Utc::now(),
            granted_by: granted_by.into(),
        };

        if permissions.contains(Permission::OWNER) {
            self.owners.insert(document_id.clone(), user_id.clone());
        }

        let key = (user_id.clone(), document_id.clone());
        if self.grants.insert(key, grant.clone()).is_none() {
            self.document_grants
                .entry(document_id)
                .or_default()
                .push(user_id);
        }

        grant
    }

    pub async fn revoke(&self, user_id: &str, document_id: &str) -> bool {
        let removed = self.grants.remove(&(user_id.to_string(), document_id.to_string())).is_some();
        if removed {
            if let Some(mut list) = self.document_grants.get_mut(document_id) {
                list.retain(|u| u != user_id);
            }
        }
        removed
    }

    pub async fn check(&self, user_id: &str, document_id: &str, required: Permission) -> CheckResult {
        self.checks_performed.fetch_add(1, Ordering::Relaxed);

        if self.owners.get(document_id).map(|o| o.value() == user_id).unwrap_or(false) {
            return CheckResult { allowed: true, reason: None };
        }

        let allowed = self
            .grants
            .get(&(user_id.to_string(), document_id.to_string()))
            .map(|g| g.permissions.contains(required))
            .unwrap_or(false);

        if !allowed {
            self.checks_denied.fetch_add(1, Ordering::Relaxed);
            return CheckResult {
                allowed: false,
                reason: Some("insufficient permissions".to_string()),
            };
        }

        CheckResult { allowed: true, reason: None }
    }

    pub async fn require(&self, user_id: &str, document_id: &str, required: Permission) -> Result<()> {
        let result = self.check(user_id, document_id, required).await;
        if result.allowed {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied {
                user: user_id.to_string(),
                document_id: document_id.to_string(),
                required: required.bits(),
            })
        }
    }

    pub fn get_document_grants(&self, document_id: &str) -> Vec<PermissionGrant> {
        self.document_grants
            .get(document_id)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| self.grants.get(&(u.clone(), document_id.to_string())).map(|g| g.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "total_grants": self.grants.len(),
            "documents": self.document_grants.len(),
            "checks_performed": self.checks_performed.load(Ordering::Relaxed),
            "checks_denied": self.checks_denied.load(Ordering::Relaxed),
        })
    }
}

impl Default for PermissionChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Types of share links, each mapping to a fixed permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareLinkType {
    View,
    Comment,
    Edit,
    Full,
}

impl ShareLinkType {
    fn permission(self) -> Permission {
        match self {
            ShareLinkType::View => Permission::READ,
            ShareLinkType::Comment => Permission::READ | Permission::COMMENT,
            ShareLinkType::Edit => Permission::READ | Permission::COMMENT | Permission::WRITE,
            ShareLinkType::Full => Permission::READ | Permission::COMMENT | Permission::WRITE | Permission::SHARE,
        }
    }
}

/// Status of an [`Invitation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
    Revoked,
}

/// A shareable link for document access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: String,
    pub document_id: String,
    pub link_type: ShareLinkType,
    pub token: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u64>,
    pub use_count: u64,
    pub password_hash: Option<String>,
    pub allowed_domains: Vec<String>,
    pub disabled: bool,
    pub metadata: serde_json::Value,
}

impl ShareLink {
    pub fn permission(&self) -> Permission {
        self.link_type.permission()
    }

    pub fn is_valid(&self) -> bool {
        if self.disabled {
            return false;
        }
        if let Some(exp) = self.expires_at {
            if Utc::now() > exp {
                return false;
            }
        }
        if let Some(max) = self.max_uses {
            if self.use_count >= max {
                return false;
            }
        }
        true
    }

    pub fn verify_password(&self, password: &str) -> bool {
        match &self.password_hash {
            None => true,
            Some(hash) => &hex::encode(Sha256::digest(password.as_bytes())) == hash,
        }
    }
}

/// An invitation to access a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub document_id: String,
    pub inviter_id: String,
    pub invitee_email: String,
    pub invitee_id: Option<String>,
    pub role: Role,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
}

impl Invitation {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn can_accept(&self) -> bool {
        self.status == InvitationStatus::Pending && !self.is_expired()
    }
}

/// Access policy for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub document_id: String,
    pub owner_id: String,
    pub public_access: Permission,
    pub default_role: Role,
    pub require_authentication: bool,
    pub allow_anonymous: bool,
    pub allowed_domains: Vec<String>,
    pub blocked_users: std::collections::HashSet<String>,
    /// Parent folder/document this policy inherits from. Carried for
    /// round-tripping but not resolved — see the Open Questions record.
    pub inherit_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessPolicy {
    fn new(document_id: String, owner_id: String, public_access: Permission) -> Self {
        let now = Utc::now();
        Self {
            document_id,
            owner_id,
            public_access,
            default_role: Role::Viewer,
            require_authentication: true,
            allow_anonymous: false,
            allowed_domains: Vec::new(),
            blocked_users: std::collections::HashSet::new(),
            inherit_from: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single field update applied to an [`AccessPolicy`] by
/// [`AccessController::update_policy`].
#[derive(Debug, Clone)]
pub enum PolicyUpdate {
    PublicAccess(Permission),
    DefaultRole(Role),
    RequireAuthentication(bool),
    AllowAnonymous(bool),
    AllowedDomains(Vec<String>),
}

fn apply_update(policy: &mut AccessPolicy, update: PolicyUpdate) {
    match update {
        PolicyUpdate::PublicAccess(p) => policy.public_access = p,
        PolicyUpdate::DefaultRole(r) => policy.default_role = r,
        PolicyUpdate::RequireAuthentication(v) => policy.require_authentication = v,
        PolicyUpdate::AllowAnonymous(v) => policy.allow_anonymous = v,
        PolicyUpdate::AllowedDomains(v) => policy.allowed_domains = v,
    }
}

/// Parameters for [`AccessController::create_share_link`].
#[derive(Debug, Clone, Default)]
pub struct ShareLinkParams {
    pub link_type: Option<ShareLinkType>,
    pub expires_in: Option<Duration>,
    pub max_uses: Option<u64>,
    pub password: Option<String>,
    pub allowed_domains: Vec<String>,
}

/// Callback invoked (synchronously) when access is granted to a user.
pub type AccessGrantedCallback = Box<dyn Fn(&str, &str, Permission) + Send + Sync>;
/// Callback invoked when an invitation is created.
pub type InvitationSentCallback = Box<dyn Fn(&Invitation) + Send + Sync>;

fn random_token(bytes: usize) -> String {
    use base64::Engine as _;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&buf)
}

fn random_hex_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Controls access to documents with sharing and invitations, built on a
/// [`PermissionChecker`].
pub struct AccessController {
    checker: Arc<PermissionChecker>,
    state: AsyncMutex<ControllerState>,
    on_access_granted: SyncMutex<Option<AccessGrantedCallback>>,
    on_invitation_sent: SyncMutex<Option<InvitationSentCallback>>,
    links_created: AtomicU64,
    links_used: AtomicU64,
    invitations_sent: AtomicU64,
    invitations_accepted: AtomicU64,
}

#[derive(Default)]
struct ControllerState {
    policies: HashMap<String, AccessPolicy>,
    share_links: HashMap<String, ShareLink>,
    doc_links: HashMap<String, Vec<String>>,
    invitations: HashMap<Uuid, Invitation>,
    doc_invitations: HashMap<String, Vec<Uuid>>,
    email_invitations: HashMap<String, Vec<Uuid>>,
}

impl AccessController {
    pub fn new(checker: Arc<PermissionChecker>) -> Self {
        Self {
            checker,
            state: AsyncMutex::new(ControllerState::default()),
            on_access_granted: SyncMutex::new(None),
            on_invitation_sent: SyncMutex::new(None),
            links_created: AtomicU64::new(0),
            links_used: AtomicU64::new(0),
            invitations_sent: AtomicU64::new(0),
            invitations_accepted: AtomicU64::new(0),
        }
    }

    pub fn on_access_granted(&self, cb: AccessGrantedCallback) {
        *self.on_access_granted.lock() = Some(cb);
    }

    pub fn on_invitation_sent(&self, cb: InvitationSentCallback) {
        *self.on_invitation_sent.lock() = Some(cb);
    }

    pub async fn create_document(&self, document_id: &str, owner_id: &str, public_access: Permission) -> AccessPolicy {
        let policy = AccessPolicy::new(document_id.to_string(), owner_id.to_string(), public_access);
        {
            let mut state = self.state.lock().await;
            state.policies.insert(document_id.to_string(), policy.clone());
        }
        self.checker.grant(owner_id, document_id, Permission::FULL, owner_id).await;
        policy
    }

    pub async fn get_policy(&self, document_id: &str) -> Option<AccessPolicy> {
        self.state.lock().await.policies.get(document_id).cloned()
    }

    pub async fn update_policy(&self, document_id: &str, updater_id: &str, updates: Vec<PolicyUpdate>) -> Result<Option<AccessPolicy>> {
        self.checker.require(updater_id, document_id, Permission::ADMIN).await?;

        let mut state = self.state.lock().await;
        let policy = match state.policies.get_mut(document_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        for update in updates {
            apply_update(policy, update);
        }
        policy.updated_at = Utc::now();
        Ok(Some(policy.clone()))
    }

    pub async fn delete_document(&self, document_id: &str, user_id: &str) -> Result<bool> {
        self.checker.require(user_id, document_id, Permission::OWNER).await?;

        let mut state = self.state.lock().await;
        state.policies.remove(document_id);
        if let Some(tokens) = state.doc_links.remove(document_id) {
            for t in tokens {
                state.share_links.remove(&t);
            }
        }
        if let Some(ids) = state.doc_invitations.remove(document_id) {
            for id in ids {
                state.invitations.remove(&id);
            }
        }
        drop(state);

        for grant in self.checker.get_document_grants(document_id) {
            self.checker.revoke(&grant.user_id, document_id).await;
        }

        Ok(true)
    }

    pub async fn create_share_link(&self, document_id: &str, creator_id: &str, params: ShareLinkParams) -> Result<ShareLink> {
        self.checker.require(creator_id, document_id, Permission::SHARE).await?;

        let link = ShareLink {
            id: random_hex_id(8),
            document_id: document_id.to_string(),
            link_type: params.link_type.unwrap_or(ShareLinkType::View),
            token: random_token(32),
            created_by: creator_id.to_string(),
            created_at: Utc::now(),
            expires_at: params
                .expires_in
                .map(|d| Utc::now() + ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::zero())),
            max_uses: params.max_uses,
            use_count: 0,
            password_hash: params.password.map(|p| hex::encode(Sha256::digest(p.as_bytes()))),
            allowed_domains: params.allowed_domains,
            disabled: false,
            metadata: serde_json::json!({}),
        };

        let mut state = self.state.lock().await;
        state.doc_links.entry(document_id.to_string()).or_default().push(link.token.clone());
        state.share_links.insert(link.token.clone(), link.clone());
        drop(state);

        self.links_created.fetch_add(1, Ordering::Relaxed);
        Ok(link)
    }

    pub async fn use_share_link(&self, token: &str, user_id: &str, password: Option<&str>, user_email: Option<&str>) -> Option<Permission> {
        let link = {
            let state = self.state.lock().await;
            state.share_links.get(token).cloned()?
        };

        if !link.is_valid() {
            return None;
        }
        if link.password_hash.is_some() && !link.verify_password(password.unwrap_or("")) {
            return None;
        }
        if !link.allowed_domains.is_empty() {
            let domain = user_email.and_then(|e| e.split('@').last()).unwrap_or("");
            if !link.allowed_domains.iter().any(|d| d == domain) {
                return None;
            }
        }

        let permission = link.permission();
        self.checker.grant(user_id, &link.document_id, permission, &link.created_by).await;

        {
            let mut state = self.state.lock().await;
            if let Some(l) = state.share_links.get_mut(token) {
                l.use_count += 1;
            }
        }
        self.links_used.fetch_add(1, Ordering::Relaxed);

        if let Some(cb) = self.on_access_granted.lock().as_ref() {
            cb(user_id, &link.document_id, permission);
        }

        Some(permission)
    }

    pub async fn get_share_link(&self, token: &str) -> Option<ShareLink> {
        self.state.lock().await.share_links.get(token).cloned()
    }

    pub async fn get_document_links(&self, document_id: &str) -> Vec<ShareLink> {
        let state = self.state.lock().await;
        state
            .doc_links
            .get(document_id)
            .map(|tokens| tokens.iter().filter_map(|t| state.share_links.get(t).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn revoke_share_link(&self, token: &str, user_id: &str) -> Result<bool> {
        let document_id = {
            let state = self.state.lock().await;
            match state.share_links.get(token) {
                Some(l) => l.document_id.clone(),
                None => return Ok(false),
            }
        };
        self.checker.require(user_id, &document_id, Permission::SHARE).await?;

        let mut state = self.state.lock().await;
        if let Some(l) = state.share_links.get_mut(token) {
            l.disabled = true;
        }
        Ok(true)
    }

    pub async fn create_invitation(
        &self,
        document_id: &str,
        inviter_id: &str,
        invitee_email: &str,
        role: Role,
        expires_in: Duration,
        message: Option<String>,
    ) -> Result<Invitation> {
        self.checker.require(inviter_id, document_id, Permission::SHARE).await?;

        let invitation = Invitation {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            inviter_id: inviter_id.to_string(),
            invitee_email: invitee_email.to_string(),
            invitee_id: None,
            role,
            status: InvitationStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::from_std(expires_in).unwrap_or_else(|_| ChronoDuration::zero()),
            accepted_at: None,
            message,
            metadata: serde_json::json!({}),
        };

        {
            let mut state = self.state.lock().await;
            state.doc_invitations.entry(document_id.to_string()).or_default().push(invitation.id);
            state
                .email_invitations
                .entry(invitee_email.to_string())
                .or_default()
                .push(invitation.id);
            state.invitations.insert(invitation.id, invitation.clone());
        }
        self.invitations_sent.fetch_add(1, Ordering::Relaxed);

        if let Some(cb) = self.on_invitation_sent.lock().as_ref() {
            cb(&invitation);
        }

        Ok(invitation)
    }

    pub async fn accept_invitation(&self, invitation_id: Uuid, user_id: &str) -> Option<PermissionGrant> {
        let invitation = {
            let state = self.state.lock().await;
            state.invitations.get(&invitation_id).cloned()?
        };
        if !invitation.can_accept() {
            return None;
        }

        let permission = invitation.role.permissions();
        let grant = self
            .checker
            .grant(user_id, &invitation.document_id, permission, &invitation.inviter_id)
            .await;

        {
            let mut state = self.state.lock().await;
            if let Some(inv) = state.invitations.get_mut(&invitation_id) {
                inv.status = InvitationStatus::Accepted;
                inv.invitee_id = Some(user_id.to_string());
                inv.accepted_at = Some(Utc::now());
            }
        }
        self.invitations_accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(cb) = self.on_access_granted.lock().as_ref() {
            cb(user_id, &invitation.document_id, permission);
        }

        Some(grant)
    }

    pub async fn decline_invitation(&self, invitation_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.invitations.get_mut(&invitation_id) {
            Some(inv) if inv.status == InvitationStatus::Pending => {
                inv.status = InvitationStatus::Declined;
                true
            }
            _ => false,
        }
    }

    pub async fn revoke_invitation(&self, invitation_id: Uuid, user_id: &str) -> Result<bool> {
        let document_id = {
            let state = self.state.lock().await;
            match state.invitations.get(&invitation_id) {
                Some(inv) => inv.document_id.clone(),
                None => return Ok(false),
            }
        };
        self.checker.require(user_id, &document_id, Permission::SHARE).await?;

        let mut state = self.state.lock().await;
        if let Some(inv) = state.invitations.get_mut(&invitation_id) {
            inv.status = InvitationStatus::Revoked;
        }
        Ok(true)
    }

    pub async fn get_invitation(&self, invitation_id: Uuid) -> Option<Invitation> {
        self.state.lock().await.invitations.get(&invitation_id).cloned()
    }

    pub async fn get_document_invitations(&self, document_id: &str) -> Vec<Invitation> {
        let state = self.state.lock().await;
        state
            .doc_invitations
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|i| state.invitations.get(i).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn get_user_invitations(&self, email: &str) -> Vec<Invitation> {
        let state = self.state.lock().await;
        state
            .email_invitations
            .get(email)
            .map(|ids| ids.iter().filter_map(|i| state.invitations.get(i).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn can_access(&self, user_id: &str, document_id: &str, required: Permission) -> bool {
        let state = self.state.lock().await;
        if let Some(policy) = state.policies.get(document_id) {
            if policy.blocked_users.contains(user_id) {
                return false;
            }
            if policy.public_access.contains(required) {
                return true;
            }
        }
        drop(state);
        self.checker.check(user_id, document_id, required).await.allowed
    }

    pub async fn get_access_list(&self, document_id: &str) -> Vec<serde_json::Value> {
        let grants = self.checker.get_document_grants(document_id);
        let owner_id = self.state.lock().await.policies.get(document_id).map(|p| p.owner_id.clone());

        grants
            .into_iter()
            .map(|grant| {
                let is_owner = owner_id.as_deref() == Some(grant.user_id.as_str());
                serde_json::json!({
                    "user_id": grant.user_id,
                    "permissions": grant.permissions.bits(),
                    "is_owner": is_owner,
                    "granted_at": grant.granted_at,
                    "granted_by": grant.granted_by,
                })
            })
            .collect()
    }

    pub async fn block_user(&self, document_id: &str, blocker_id: &str, user_id: &str) -> Result<bool> {
        self.checker.require(blocker_id, document_id, Permission::ADMIN).await?;

        let mut state = self.state.lock().await;
        let blocked = match state.policies.get_mut(document_id) {
            Some(policy) => {
                policy.blocked_users.insert(user_id.to_string());
                true
            }
            None => false,
        };
        drop(state);

        if blocked {
            self.checker.revoke(user_id, document_id).await;
        }
        Ok(blocked)
    }

    pub async fn unblock_user(&self, document_id: &str, unblocker_id: &str, user_id: &str) -> Result<bool> {
        self.checker.require(unblocker_id, document_id, Permission::ADMIN).await?;

        let mut state = self.state.lock().await;
        Ok(match state.policies.get_mut(document_id) {
            Some(policy) => {
                policy.blocked_users.remove(user_id);
                true
            }
            None => false,
        })
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let pending = state
            .invitations
            .values()
            .filter(|i| i.status == InvitationStatus::Pending)
            .count();
        serde_json::json!({
            "documents": state.policies.len(),
            "share_links_created": self.links_created.load(Ordering::Relaxed),
            "share_links_used": self.links_used.load(Ordering::Relaxed),
            "active_share_links": state.share_links.len(),
            "invitations_sent": self.invitations_sent.load(Ordering::Relaxed),
            "invitations_accepted": self.invitations_accepted.load(Ordering::Relaxed),
            "pending_invitations": pending,
            "permission_stats": self.checker.get_stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AccessController {
        AccessController::new(Arc::new(PermissionChecker::new()))
    }

    #[tokio::test]
    async fn owner_has_full_access() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        assert!(ctl.can_access("alice", "doc-1", Permission::ADMIN).await);
    }

    #[tokio::test]
    async fn share_link_grants_scoped_permission() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        let link = ctl
            .create_share_link("doc-1", "alice", ShareLinkParams {
                link_type: Some(ShareLinkType::Comment),
                ..Default::default()
            })
            .await
            .unwrap();

        let granted = ctl.use_share_link(&link.token, "bob", None, None).await;
        assert_eq!(granted, Some(Permission::READ | Permission::COMMENT));
        assert!(!ctl.can_access("bob", "doc-1", Permission::WRITE).await);
        assert!(ctl.can_access("bob", "doc-1", Permission::READ).await);
    }

    #[tokio::test]
    async fn share_link_rejects_wrong_password() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        let link = ctl
            .create_share_link("doc-1", "alice", ShareLinkParams {
                password: Some("secret".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(ctl.use_share_link(&link.token, "bob", Some("wrong"), None).await.is_none());
        assert!(ctl.use_share_link(&link.token, "bob", Some("secret"), None).await.is_some());
    }

    #[tokio::test]
    async fn invitation_round_trip() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        let invite = ctl
            .create_invitation("doc-1", "alice", "bob@example.com", Role::Editor, Duration::from_secs(86400), None)
            .await
            .unwrap();

        let grant = ctl.accept_invitation(invite.id, "bob").await.unwrap();
        assert!(grant.permissions.contains(Permission::WRITE));
        assert!(ctl.can_access("bob", "doc-1", Permission::WRITE).await);
    }

    #[tokio::test]
    async fn blocked_user_loses_access() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        ctl.checker.grant("bob", "doc-1", Permission::READ, "alice").await;
        assert!(ctl.can_access("bob", "doc-1", Permission::READ).await);

        ctl.block_user("doc-1", "alice", "bob").await.unwrap();
        assert!(!ctl.can_access("bob", "doc-1", Permission::READ).await);
    }

    #[tokio::test]
    async fn delete_document_cascades() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        ctl.create_share_link("doc-1", "alice", ShareLinkParams::default()).await.unwrap();
        ctl.create_invitation("doc-1", "alice", "bob@example.com", Role::Viewer, Duration::from_secs(86400), None)
            .await
            .unwrap();

        ctl.delete_document("doc-1", "alice").await.unwrap();
        assert!(ctl.get_policy("doc-1").await.is_none());
        assert!(ctl.get_document_links("doc-1").await.is_empty());
        assert!(ctl.get_document_invitations("doc-1").await.is_empty());
    }

    #[tokio::test]
    async fn delete_document_revokes_grants() {
        let ctl = controller();
        ctl.create_document("doc-1", "alice", Permission::NONE).await;
        ctl.checker.grant("bob", "doc-1", Permission::READ, "alice").await;
        assert!(ctl.can_access("bob", "doc-1", Permission::READ).await);

        ctl.delete_document("doc-1", "alice").await.unwrap();

        assert!(!ctl.can_access("alice", "doc-1", Permission::READ).await);
        assert!(!ctl.can_access("bob", "doc-1", Permission::READ).await);
        assert!(ctl.checker.get_document_grants("doc-1").is_empty());
    }
}
