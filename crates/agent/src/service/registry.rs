//! Registry — ServiceKind → constructor, plus role eligibility.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{BlobService, CrdtService, Service, ServiceContext, ServiceKind};
use crate::error::ServiceError;
use crate::state::{Role, RoleSet};

pub type ServiceFactory = Arc<dyn Fn(&ServiceContext) -> Box<dyn Service> + Send + Sync>;

struct Entry {
    /// `None`: every role may run it.
    roles: Option<Vec<Role>>,
    factory: ServiceFactory,
}

/// Open registry of service constructors. Adding a kind never touches the
/// lifecycle code.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<ServiceKind, Entry>,
}

impl ServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in services and their role requirements.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_for_roles(ServiceKind::Blob, [Role::Provider, Role::Seed], |ctx| {
            Box::new(BlobService::new(ctx.clone()))
        });
        registry.register_for_roles(ServiceKind::Crdt, [Role::Provider, Role::Relay, Role::Seed], |ctx| {
            Box::new(CrdtService::new(ctx.clone()))
        });
        registry
    }

    /// Register `kind` for every role. Replaces an existing entry.
    pub fn register<F>(&mut self, kind: ServiceKind, factory: F)
    where
        F: Fn(&ServiceContext) -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.entries.insert(
            kind,
            Entry {
                roles: None,
                factory: Arc::new(factory),
            },
        );
    }

    /// Register `kind`, runnable only when one of `roles` is active.
    pub fn register_for_roles<F>(&mut self, kind: ServiceKind, roles: impl IntoIterator<Item = Role>, factory: F)
    where
        F: Fn(&ServiceContext) -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.entries.insert(
            kind,
            Entry {
                roles: Some(roles.into_iter().collect()),
                factory: Arc::new(factory),
            },
        );
    }

    pub fn is_registered(&self, kind: ServiceKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Registered and allowed for `roles`.
    pub fn is_eligible(&self, kind: ServiceKind, roles: &RoleSet) -> bool {
        match self.entries.get(&kind) {
            Some(Entry { roles: None, .. }) => true,
            Some(Entry { roles: Some(required), .. }) => roles.contains_any(required),
            None => false,
        }
    }

    /// Construct a fresh, not yet started instance.
    pub fn instantiate(&self, kind: ServiceKind, ctx: &ServiceContext) -> Result<Box<dyn Service>, ServiceError> {
        let entry = self.entries.get(&kind).ok_or(ServiceError::NotRegistered(kind))?;
        Ok((entry.factory)(ctx))
    }

    /// The configured services this node will actually run, in configured
    /// order. Ineligible ones are skipped with a warning.
    pub fn select(&self, configured: &[ServiceKind], roles: &RoleSet) -> Vec<ServiceKind> {
        configured
            .iter()
            .copied()
            .filter(|kind| {
                if !self.is_registered(*kind) {
                    warn!("Service {} has no registered implementation, skipping", kind);
                    return false;
                }
                let eligible = self.is_eligible(*kind, roles);
                if !eligible {
                    warn!("Service {} is not enabled for roles [{}], skipping", kind, roles);
                }
                eligible
            })
            .collect()
    }
}
