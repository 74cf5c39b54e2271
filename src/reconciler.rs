//! Subscription reconciliation for one trigger instance.
//!
//! Activation runs [`Reconciler::exists`] and only calls
//! [`Reconciler::create`] when no subscription with the same type and
//! callback is registered, so repeated activation never registers a
//! duplicate. Deactivation runs [`Reconciler::delete`], which is best effort:
//! remote failures are reported as [`DeleteOutcome::Failed`] rather than
//! returned as errors, and the tracked id is kept so teardown can be retried.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::api::EventSubApi;
use crate::error::{ApiError, Result};
use crate::store::WebhookLinks;
use crate::types::{CreateSubscriptionRequest, SubscriptionDescriptor, Transport};

pub const SUBSCRIPTION_VERSION: &str = "1";
pub const TRANSPORT_METHOD: &str = "webhook";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created { webhook_id: String },
    /// The channel lookup found nobody; the subscription was registered with
    /// an empty target id.
    CreatedDegenerate {
        webhook_id: String,
        channel_name: String,
    },
}

impl CreateOutcome {
    pub fn webhook_id(&self) -> &str {
        match self {
            Self::Created { webhook_id } | Self::CreatedDegenerate { webhook_id, .. } => webhook_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// A matching subscription was already registered; nothing was created.
    AlreadyRegistered { webhook_id: String },
    Created { webhook_id: String },
    CreatedDegenerate {
        webhook_id: String,
        channel_name: String,
    },
}

impl ActivationOutcome {
    pub fn webhook_id(&self) -> &str {
        match self {
            Self::AlreadyRegistered { webhook_id }
            | Self::Created { webhook_id }
            | Self::CreatedDegenerate { webhook_id, .. } => webhook_id,
        }
    }
}

impl From<CreateOutcome> for ActivationOutcome {
    fn from(outcome: CreateOutcome) -> Self {
        match outcome {
            CreateOutcome::Created { webhook_id } => Self::Created { webhook_id },
            CreateOutcome::CreatedDegenerate {
                webhook_id,
                channel_name,
            } => Self::CreatedDegenerate {
                webhook_id,
                channel_name,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    NothingTracked,
    Deleted { webhook_id: String },
    /// The remote delete failed; the id is still tracked.
    Failed { webhook_id: String, reason: String },
}

impl DeleteOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

pub struct Reconciler<'a> {
    api: &'a dyn EventSubApi,
    links: &'a mut dyn WebhookLinks,
    instance_id: &'a str,
    secret: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        api: &'a dyn EventSubApi,
        links: &'a mut dyn WebhookLinks,
        instance_id: &'a str,
        secret: &'a str,
    ) -> Self {
        Self {
            api,
            links,
            instance_id,
            secret,
        }
    }

    /// Walk every page of registered subscriptions looking for one with the
    /// same type and callback. The first match is tracked for this instance;
    /// without a match the instance is left with no tracked id.
    #[instrument(skip_all, fields(instance = %self.instance_id, event = %desired.event_type))]
    pub async fn exists(
        &mut self,
        desired: &SubscriptionDescriptor,
        callback_url: &str,
    ) -> Result<bool> {
        let mut cursor: Option<String> = None;

        loop {
            let page = self.api.list_subscriptions(cursor.as_deref()).await?;

            if let Some(found) = page
                .data
                .iter()
                .find(|record| record.matches(desired.event_type, callback_url))
            {
                info!(webhook_id = %found.id, status = %found.status, "subscription already registered");
                self.links.set_webhook_id(self.instance_id, found.id.clone());
                return Ok(true);
            }

            match page.pagination.cursor.filter(|c| !c.is_empty()) {
                Some(next) if cursor.as_deref() != Some(next.as_str()) && !page.data.is_empty() => {
                    cursor = Some(next);
                }
                _ => {
                    self.links.clear_webhook_id(self.instance_id);
                    return Ok(false);
                }
            }
        }
    }

    /// Resolve the channel, register the subscription and track its id.
    #[instrument(skip_all, fields(instance = %self.instance_id, event = %desired.event_type))]
    pub async fn create(
        &mut self,
        desired: &SubscriptionDescriptor,
        callback_url: &str,
    ) -> Result<CreateOutcome> {
        let mut lookup_missed = false;
        let target_entity_id = if desired.event_type.is_client_scoped() {
            String::new()
        } else {
            match self.api.find_user(&desired.channel_name).await? {
                Some(user) => user.id,
                None => {
                    // Registered anyway with an empty id; the service will
                    // never match it to a broadcaster.
                    warn!(channel = %desired.channel_name, "channel lookup returned no user");
                    lookup_missed = true;
                    String::new()
                }
            }
        };

        let request = CreateSubscriptionRequest {
            event_type: desired.event_type,
            version: SUBSCRIPTION_VERSION,
            condition: desired.condition(&target_entity_id, self.api.client_id()),
            transport: Transport {
                method: TRANSPORT_METHOD.to_string(),
                callback: Some(callback_url.to_string()),
                secret: Some(self.secret.to_string()),
            },
        };

        let record = self.api.create_subscription(&request).await?;
        info!(webhook_id = %record.id, status = %record.status, "subscription created");
        self.links.set_webhook_id(self.instance_id, record.id.clone());

        Ok(if lookup_missed {
            CreateOutcome::CreatedDegenerate {
                webhook_id: record.id,
                channel_name: desired.channel_name.clone(),
            }
        } else {
            CreateOutcome::Created {
                webhook_id: record.id,
            }
        })
    }

    /// Remove the tracked subscription. Remote failures are reported, not
    /// raised, and leave the tracked id in place.
    #[instrument(skip_all, fields(instance = %self.instance_id))]
    pub async fn delete(&mut self) -> DeleteOutcome {
        let Some(webhook_id) = self.links.webhook_id(self.instance_id) else {
            return DeleteOutcome::NothingTracked;
        };

        match self.api.delete_subscription(&webhook_id).await {
            Ok(()) => {
                self.links.clear_webhook_id(self.instance_id);
                info!(%webhook_id, "subscription deleted");
                DeleteOutcome::Deleted { webhook_id }
            }
            Err(e) => {
                warn!(%webhook_id, error = %e, "subscription delete failed");
                DeleteOutcome::Failed {
                    webhook_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Exists, then Create only when nothing matched. A previously tracked
    /// id that no longer matches is deleted remotely first; if that fails the
    /// activation is aborted and the old id stays tracked.
    pub async fn activate(
        &mut self,
        desired: &SubscriptionDescriptor,
        callback_url: &str,
    ) -> Result<ActivationOutcome> {
        let previous = self.links.webhook_id(self.instance_id);
        let found = self.exists(desired, callback_url).await?;
        let current = self.links.webhook_id(self.instance_id);

        if let Some(stale) = previous.filter(|p| current.as_deref() != Some(p.as_str())) {
            if let Err(e) = self.retire(&stale).await {
                self.links.set_webhook_id(self.instance_id, stale);
                return Err(e);
            }
        }

        if found {
            return Ok(ActivationOutcome::AlreadyRegistered {
                webhook_id: current.unwrap_or_default(),
            });
        }
        Ok(self.create(desired, callback_url).await?.into())
    }

    /// Remove a subscription this instance no longer wants. Already gone
    /// (404) counts as removed.
    async fn retire(&self, webhook_id: &str) -> Result<()> {
        match self.api.delete_subscription(webhook_id).await {
            Ok(()) => {
                info!(%webhook_id, "replaced subscription deleted");
                Ok(())
            }
            Err(e) if e.status_code() == Some(404) => Ok(()),
            Err(e) => {
                warn!(%webhook_id, error = %e, "could not delete replaced subscription");
                Err(ApiError::StaleSubscription {
                    webhook_id: webhook_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LinkStore;
    use crate::types::{
        AuxiliaryCondition, EventType, Pagination, SubscriptionPage, SubscriptionRecord, User,
    };
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const CALLBACK: &str = "https://example.com/hooks/wf-1/webhook";

    /// In-process registry that behaves like the remote service.
    #[derive(Default)]
    struct FakeApi {
        records: Mutex<Vec<SubscriptionRecord>>,
        users: Vec<User>,
        page_size: usize,
        next_id: AtomicUsize,
        list_calls: AtomicUsize,
        lookup_calls: AtomicUsize,
        create_calls: AtomicUsize,
        delete_calls: AtomicUsize,
        fail_delete: AtomicBool,
        fail_create: AtomicBool,
        last_request: Mutex<Option<CreateSubscriptionRequest>>,
    }

    impl FakeApi {
        fn with_user(login: &str, id: &str) -> Self {
            Self {
                users: vec![User {
                    id: id.into(),
                    login: login.into(),
                }],
                page_size: 100,
                ..Default::default()
            }
        }

        fn register(&self, id: &str, event_type: &str, callback: &str) {
            self.records.lock().unwrap().push(SubscriptionRecord {
                id: id.into(),
                event_type: event_type.into(),
                condition: serde_json::json!({}),
                transport: Transport {
                    method: "webhook".into(),
                    callback: Some(callback.into()),
                    secret: None,
                },
                status: "enabled".into(),
            });
        }
    }

    #[async_trait]
    impl EventSubApi for FakeApi {
        async fn list_subscriptions(&self, cursor: Option<&str>) -> Result<SubscriptionPage> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let records = self.records.lock().unwrap();
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + self.page_size).min(records.len());
            let next = (end < records.len()).then(|| end.to_string());
            Ok(SubscriptionPage {
                data: records[start..end].to_vec(),
                pagination: Pagination { cursor: next },
            })
        }

        async fn find_user(&self, login: &str) -> Result<Option<User>> {
            self.lookup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.users.iter().find(|u| u.login == login).cloned())
        }

        async fn create_subscription(
            &self,
            request: &CreateSubscriptionRequest,
        ) -> Result<SubscriptionRecord> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    endpoint: "/eventsub/subscriptions".into(),
                    status: 409,
                    body: "conflict".into(),
                });
            }
            *self.last_request.lock().unwrap() = Some(request.clone());
            let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.register(
                &id,
                request.event_type.as_str(),
                request.transport.callback.as_deref().unwrap_or_default(),
            );
            Ok(self.records.lock().unwrap().last().unwrap().clone())
        }

        async fn delete_subscription(&self, id: &str) -> Result<()> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(ApiError::transport("/eventsub/subscriptions", "connection reset"));
            }
            self.records.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }

        fn client_id(&self) -> &str {
            "test-client"
        }
    }

    fn desired(event_type: EventType) -> SubscriptionDescriptor {
        SubscriptionDescriptor {
            event_type,
            channel_name: "somechannel".into(),
            auxiliary: AuxiliaryCondition::default(),
        }
    }

    fn links() -> LinkStore {
        LinkStore::new(PathBuf::from("."))
    }

    #[tokio::test]
    async fn repeated_activation_creates_once() {
        let api = FakeApi::with_user("somechannel", "1234");
        let mut store = links();
        let want = desired(EventType::StreamOnline);

        let first = Reconciler::new(&api, &mut store, "wf-1", "s3cret-value")
            .activate(&want, CALLBACK)
            .await
            .unwrap();
        assert!(matches!(first, ActivationOutcome::Created { .. }));

        for _ in 0..3 {
            let again = Reconciler::new(&api, &mut store, "wf-1", "s3cret-value")
                .activate(&want, CALLBACK)
                .await
                .unwrap();
            assert_eq!(again.webhook_id(), first.webhook_id());
            assert!(matches!(again, ActivationOutcome::AlreadyRegistered { .. }));
        }

        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.delete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.records.lock().unwrap().len(), 1);
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some(first.webhook_id()));
    }

    #[tokio::test]
    async fn exists_requires_matching_type_and_callback() {
        let api = FakeApi::with_user("somechannel", "1234");
        api.register("other-type", "stream.offline", CALLBACK);
        api.register("other-callback", "stream.online", "https://example.com/hooks/wf-2/webhook");
        let mut store = links();

        let found = Reconciler::new(&api, &mut store, "wf-1", "s")
            .exists(&desired(EventType::StreamOnline), CALLBACK)
            .await
            .unwrap();
        assert!(!found);
        assert!(store.webhook_id("wf-1").is_none());
    }

    #[tokio::test]
    async fn exists_without_match_drops_tracked_id() {
        let api = FakeApi::with_user("somechannel", "1234");
        let mut store = links();
        store.set_webhook_id("wf-1", "gone".into());

        let found = Reconciler::new(&api, &mut store, "wf-1", "s")
            .exists(&desired(EventType::StreamOnline), CALLBACK)
            .await
            .unwrap();
        assert!(!found);
        assert!(store.webhook_id("wf-1").is_none());
    }

    #[tokio::test]
    async fn reactivation_with_new_type_deletes_old_subscription() {
        let api = FakeApi::with_user("somechannel", "1234");
        api.register("old-sub", "stream.online", CALLBACK);
        let mut store = links();
        store.set_webhook_id("wf-1", "old-sub".into());

        let outcome = Reconciler::new(&api, &mut store, "wf-1", "s")
            .activate(&desired(EventType::StreamOffline), CALLBACK)
            .await
            .unwrap();

        assert!(matches!(outcome, ActivationOutcome::Created { .. }));
        assert_eq!(api.delete_calls.load(Ordering::SeqCst), 1);
        let records = api.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "stream.offline");
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some(records[0].id.as_str()));
    }

    #[tokio::test]
    async fn reactivation_keeps_old_id_when_it_cannot_be_deleted() {
        let api = FakeApi::with_user("somechannel", "1234");
        api.register("old-sub", "stream.online", CALLBACK);
        api.fail_delete.store(true, Ordering::SeqCst);
        let mut store = links();
        store.set_webhook_id("wf-1", "old-sub".into());

        let err = Reconciler::new(&api, &mut store, "wf-1", "s")
            .activate(&desired(EventType::StreamOffline), CALLBACK)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::StaleSubscription { ref webhook_id, .. } if webhook_id == "old-sub"));
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some("old-sub"));
    }

    #[tokio::test]
    async fn exists_walks_every_page() {
        let mut api = FakeApi::with_user("somechannel", "1234");
        api.page_size = 2;
        for i in 0..5 {
            api.register(&format!("noise-{i}"), "channel.cheer", CALLBACK);
        }
        api.register("target", "stream.online", CALLBACK);
        let mut store = links();

        let found = Reconciler::new(&api, &mut store, "wf-1", "s")
            .exists(&desired(EventType::StreamOnline), CALLBACK)
            .await
            .unwrap();
        assert!(found);
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some("target"));
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn create_builds_pinned_request() {
        let api = FakeApi::with_user("somechannel", "1234");
        let mut store = links();

        let outcome = Reconciler::new(&api, &mut store, "wf-1", "s3cret-value")
            .create(&desired(EventType::ChannelFollow), CALLBACK)
            .await
            .unwrap();

        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.version, "1");
        assert_eq!(request.transport.method, "webhook");
        assert_eq!(request.transport.callback.as_deref(), Some(CALLBACK));
        assert_eq!(request.transport.secret.as_deref(), Some("s3cret-value"));
        assert_eq!(request.condition["broadcaster_user_id"], "1234");
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some(outcome.webhook_id()));
    }

    #[tokio::test]
    async fn lookup_miss_creates_with_empty_target() {
        let api = FakeApi::with_user("someoneelse", "1");
        let mut store = links();

        let outcome = Reconciler::new(&api, &mut store, "wf-1", "s")
            .create(&desired(EventType::StreamOnline), CALLBACK)
            .await
            .unwrap();

        assert!(matches!(outcome, CreateOutcome::CreatedDegenerate { ref channel_name, .. } if channel_name == "somechannel"));
        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.condition["broadcaster_user_id"], "");
        assert!(store.webhook_id("wf-1").is_some());
    }

    #[tokio::test]
    async fn authorization_events_skip_lookup() {
        let api = FakeApi::with_user("somechannel", "1234");
        let mut store = links();

        let outcome = Reconciler::new(&api, &mut store, "wf-1", "s")
            .create(&desired(EventType::UserAuthorizationGrant), CALLBACK)
            .await
            .unwrap();

        assert!(matches!(outcome, CreateOutcome::Created { .. }));
        assert_eq!(api.lookup_calls.load(Ordering::SeqCst), 0);
        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.condition["client_id"], "test-client");
    }

    #[tokio::test]
    async fn create_failure_propagates_and_tracks_nothing() {
        let api = FakeApi::with_user("somechannel", "1234");
        api.fail_create.store(true, Ordering::SeqCst);
        let mut store = links();

        let err = Reconciler::new(&api, &mut store, "wf-1", "s")
            .activate(&desired(EventType::StreamOnline), CALLBACK)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(409));
        assert!(store.webhook_id("wf-1").is_none());
    }

    #[tokio::test]
    async fn delete_without_link_makes_no_call() {
        let api = FakeApi::with_user("somechannel", "1234");
        let mut store = links();

        let outcome = Reconciler::new(&api, &mut store, "wf-1", "s").delete().await;
        assert_eq!(outcome, DeleteOutcome::NothingTracked);
        assert!(outcome.succeeded());
        assert_eq!(api.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_clears_link_only_on_success() {
        let api = FakeApi::with_user("somechannel", "1234");
        api.register("sub-x", "stream.online", CALLBACK);
        let mut store = links();
        store.set_webhook_id("wf-1", "sub-x".into());

        api.fail_delete.store(true, Ordering::SeqCst);
        let failed = Reconciler::new(&api, &mut store, "wf-1", "s").delete().await;
        assert!(!failed.succeeded());
        assert_eq!(store.webhook_id("wf-1").as_deref(), Some("sub-x"));

        api.fail_delete.store(false, Ordering::SeqCst);
        let deleted = Reconciler::new(&api, &mut store, "wf-1", "s").delete().await;
        assert_eq!(deleted, DeleteOutcome::Deleted { webhook_id: "sub-x".into() });
        assert!(store.webhook_id("wf-1").is_none());
        assert!(api.records.lock().unwrap().is_empty());
    }

    #[test]
    fn outcomes_serialize_for_the_host() {
        let created: ActivationOutcome = CreateOutcome::CreatedDegenerate {
            webhook_id: "a".into(),
            channel_name: "c".into(),
        }
        .into();
        let v = serde_json::to_value(&created).unwrap();
        assert_eq!(v["outcome"], "created_degenerate");
        assert_eq!(v["webhook_id"], "a");

        let v = serde_json::to_value(ActivationOutcome::AlreadyRegistered {
            webhook_id: "b".into(),
        })
        .unwrap();
        assert_eq!(v["outcome"], "already_registered");

        let v = serde_json::to_value(DeleteOutcome::NothingTracked).unwrap();
        assert_eq!(v["outcome"], "nothing_tracked");
    }
}
