//! Processing of inbound Drive push notifications.
//!
//! Drive's push messages only say "something changed" for a channel. The
//! [`ChangeProcessor`] resolves the channel back to its user, reads the
//! change stream from the user's cursor, and turns each changed file into
//! activity events for the [`ActivityRouter`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityRouter};
use crate::credentials::{AccessToken, CredentialError, CredentialSource};
use crate::drive::{Change, DriveApi, DriveError, FileMetadata};
use crate::store::{ChangeCursor, ChannelStore, CursorStore, KvStore, StoreError};

/// Resource state Drive sends once when a channel is created.
pub const RESOURCE_STATE_SYNC: &str = "sync";

/// Tolerance between a change and the share it reflects.
const SHARE_WINDOW_SECS: i64 = 60;

/// How far before a change to look for activity when no cursor time exists.
const ACTIVITY_LOOKBACK_SECS: i64 = 60;

/// Errors that abort processing of a push notification.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("drive request failed: {0}")]
    Drive(#[from] DriveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A push notification as received on the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    /// User the channel was registered for (`userId` query parameter).
    pub user_id: String,

    /// `X-Goog-Channel-ID`
    pub channel_id: String,

    /// `X-Goog-Resource-ID`
    pub resource_id: Option<String>,

    /// `X-Goog-Resource-State`
    pub resource_state: String,

    /// `X-Goog-Message-Number`
    pub message_number: Option<u64>,
}

/// Turns push notifications into user notifications.
pub struct ChangeProcessor {
    channels: ChannelStore,
    cursors: CursorStore,
    credentials: Arc<dyn CredentialSource>,
    drive: Arc<dyn DriveApi>,
    router: ActivityRouter,
}

impl ChangeProcessor {
    /// Creates a processor reading channels and cursors from `kv`.
    pub fn new(
        kv: Arc<dyn KvStore>,
        credentials: Arc<dyn CredentialSource>,
        drive: Arc<dyn DriveApi>,
        router: ActivityRouter,
    ) -> Self {
        Self {
            channels: ChannelStore::new(kv.clone()),
            cursors: CursorStore::new(kv),
            credentials,
            drive,
            router,
        }
    }

    /// Processes one push notification.
    ///
    /// Returns the number of notifications delivered. Pushes for unknown,
    /// replaced or expired channels are ignored.
    pub async fn process(&self, push: &PushNotification) -> Result<usize, ProcessError> {
        self.process_at(push, Utc::now()).await
    }

    /// Like [`Self::process`], with an explicit current time for the
    /// stale-channel check and the activity lookback.
    pub async fn process_at(
        &self,
        push: &PushNotification,
        now: DateTime<Utc>,
    ) -> Result<usize, ProcessError> {
        let user_id = push.user_id.as_str();

        if push.resource_state == RESOURCE_STATE_SYNC {
            debug!(user_id = %user_id, channel_id = %push.channel_id, "Channel sync message");
            return Ok(0);
        }

        let Some(record) = self.channels.get(user_id).await? else {
            debug!(user_id = %user_id, "Push for user without a watch channel");
            return Ok(0);
        };
        if record.channel_id != push.channel_id {
            debug!(
                user_id = %user_id,
                channel_id = %push.channel_id,
                current_channel_id = %record.channel_id,
                "Push for a replaced channel"
            );
            return Ok(0);
        }
        if record.is_stale(now) {
            debug!(user_id = %user_id, channel_id = %push.channel_id, "Push for an expired channel");
            return Ok(0);
        }

        let token = self.credentials.access_token(user_id).await?;

        let Some(cursor) = self.cursors.get(user_id).await? else {
            let page_token = self.drive.get_start_page_token(&token).await?;
            self.cursors
                .put(
                    user_id,
                    &ChangeCursor {
                        page_token,
                        last_activity_at: None,
                    },
                )
                .await?;
            debug!(user_id = %user_id, "Initialized change cursor");
            return Ok(0);
        };

        let (changes, next_token) = self.read_changes(&token, &cursor.page_token).await?;

        let mut delivered = 0;
        let mut newest = cursor.last_activity_at;

        for change in &changes {
            let Some(file) = change.file.as_ref().filter(|_| !change.removed) else {
                continue;
            };
            let file_id = change.file_id.clone().unwrap_or_else(|| file.id.clone());
            let changed_at = change.time.unwrap_or(now);

            if is_new_share(file, changed_at) {
                if self
                    .router
                    .handle(&token, user_id, &ActivityEvent::file_shared(file_id))
                    .await
                {
                    delivered += 1;
                }
                continue;
            }

            let since = cursor
                .last_activity_at
                .unwrap_or_else(|| changed_at - Duration::seconds(ACTIVITY_LOOKBACK_SECS));
            let activities = match self.drive.query_activity(&token, &file_id, Some(since)).await {
                Ok(activities) => activities,
                Err(e) => {
                    warn!(user_id = %user_id, file_id = %file_id, error = %e, "Activity query failed");
                    continue;
                }
            };

            for activity in &activities {
                if let Some(at) = activity.occurred_at() {
                    newest = newest.max(Some(at));
                }
                if activity.by_current_user() {
                    continue;
                }
                let Some(event) = ActivityEvent::from_activity(&file_id, activity) else {
                    continue;
                };
                if self.router.handle(&token, user_id, &event).await {
                    delivered += 1;
                }
            }
        }

        self.cursors
            .put(
                user_id,
                &ChangeCursor {
                    page_token: next_token,
                    last_activity_at: newest,
                },
            )
            .await?;

        info!(
            user_id = %user_id,
            changes = changes.len(),
            delivered,
            "Processed Drive push notification"
        );
        Ok(delivered)
    }

    /// Reads every page from `page_token`. Returns the changes and the
    /// token to resume from.
    async fn read_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
    ) -> Result<(Vec<Change>, String), ProcessError> {
        let mut changes = Vec::new();
        let mut page_token = page_token.to_string();

        loop {
            let page = self.drive.list_changes(token, &page_token).await?;
            changes.extend(page.changes);

            if let Some(next) = page.next_page_token {
                page_token = next;
                continue;
            }
            // The last page always carries the new start token; fall back
            // to re-reading from the same page otherwise.
            return Ok((changes, page.new_start_page_token.unwrap_or(page_token)));
        }
    }
}

/// A file counts as newly shared when it has a sharer, was shared with the
/// user around the time of the change, and was never opened.
fn is_new_share(file: &FileMetadata, changed_at: DateTime<Utc>) -> bool {
    let Some(shared_at) = file.shared_with_me_time else {
        return false;
    };
    file.sharing_user.is_some()
        && file.viewed_by_me_time.is_none()
        && (changed_at - shared_at).num_seconds().abs() <= SHARE_WINDOW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{
        ActionDetail, Actor, ActorUser, Comment, CommentAction, DriveActivity, DriveUser,
        FileComment, KnownUser, Subtyped, Target,
    };
    use crate::notify::NotificationDispatcher;
    use crate::store::MemoryKvStore;
    use crate::test_support::{DriveCall, FakeCredentials, FakeDrive, RecordingSink};
    use crate::types::WatchChannelRecord;

    struct Fixture {
        drive: Arc<FakeDrive>,
        sink: Arc<RecordingSink>,
        cursors: CursorStore,
        channels: ChannelStore,
        processor: ChangeProcessor,
    }

    fn fixture() -> Fixture {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let drive = Arc::new(FakeDrive::new());
        let sink = Arc::new(RecordingSink::default());
        let credentials = Arc::new(FakeCredentials::with_users(&["alice"]));
        let router = ActivityRouter::new(
            drive.clone(),
            NotificationDispatcher::new(sink.clone()),
            "https://chat.example.com",
        );
        Fixture {
            drive: drive.clone(),
            sink,
            cursors: CursorStore::new(kv.clone()),
            channels: ChannelStore::new(kv.clone()),
            processor: ChangeProcessor::new(kv, credentials, drive, router),
        }
    }

    fn push(state: &str) -> PushNotification {
        PushNotification {
            user_id: "alice".into(),
            channel_id: "chan-1".into(),
            resource_id: Some("res-1".into()),
            resource_state: state.into(),
            message_number: Some(2),
        }
    }

    async fn watch(f: &Fixture, expires_at: DateTime<Utc>) {
        f.channels
            .put(&WatchChannelRecord {
                channel_id: "chan-1".into(),
                resource_id: "res-1".into(),
                user_id: "alice".into(),
                expires_at,
            })
            .await
            .unwrap();
    }

    async fn cursor(f: &Fixture, token: &str, last: Option<DateTime<Utc>>) {
        f.cursors
            .put(
                "alice",
                &ChangeCursor {
                    page_token: token.into(),
                    last_activity_at: last,
                },
            )
            .await
            .unwrap();
    }

    fn file_change(file: FileMetadata, time: DateTime<Utc>) -> Change {
        Change {
            file_id: Some(file.id.clone()),
            removed: false,
            time: Some(time),
            file: Some(file),
        }
    }

    fn comment_activity(subtype: &str, at: DateTime<Utc>, by_me: bool) -> DriveActivity {
        DriveActivity {
            primary_action_detail: ActionDetail {
                comment: Some(CommentAction {
                    post: Some(Subtyped {
                        subtype: subtype.into(),
                    }),
                    ..CommentAction::default()
                }),
            },
            actors: vec![Actor {
                user: Some(ActorUser {
                    known_user: Some(KnownUser {
                        person_name: "people/9".into(),
                        is_current_user: by_me,
                    }),
                }),
            }],
            targets: vec![Target {
                file_comment: Some(FileComment {
                    legacy_comment_id: "c1".into(),
                    legacy_discussion_id: "c1".into(),
                    link_to_discussion: "https://docs.example.com/f1#c1".into(),
                }),
            }],
            timestamp: Some(at),
            time_range: None,
        }
    }

    fn doc(id: &str) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            name: "Roadmap".into(),
            ..FileMetadata::default()
        }
    }

    #[tokio::test]
    async fn sync_messages_are_ignored() {
        let f = fixture();
        watch(&f, Utc::now() + Duration::days(1)).await;

        assert_eq!(f.processor.process(&push("sync")).await.unwrap(), 0);
        assert!(f.drive.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_replaced_or_stale_channels_are_ignored() {
        let f = fixture();
        assert_eq!(f.processor.process(&push("change")).await.unwrap(), 0);

        watch(&f, Utc::now() + Duration::days(1)).await;
        let mut other = push("change");
        other.channel_id = "chan-old".into();
        assert_eq!(f.processor.process(&other).await.unwrap(), 0);

        watch(&f, Utc::now() - Duration::minutes(1)).await;
        assert_eq!(f.processor.process(&push("change")).await.unwrap(), 0);

        assert!(f.drive.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_cursor_is_initialized() {
        let f = fixture();
        watch(&f, Utc::now() + Duration::days(1)).await;

        assert_eq!(f.processor.process(&push("change")).await.unwrap(), 0);

        let stored = f.cursors.get("alice").await.unwrap().unwrap();
        assert_eq!(stored.page_token, "start-1");
    }

    #[tokio::test]
    async fn comment_activity_is_routed_and_cursor_advances() {
        let f = fixture();
        let now = Utc::now();
        watch(&f, now + Duration::days(1)).await;
        cursor(&f, "p1", None).await;

        let at = now - Duration::seconds(10);
        f.drive.add_changes("p1", vec![file_change(doc("f1"), now)], Some("p2"), None);
        f.drive.add_changes("p2", vec![], None, Some("p3"));
        f.drive.add_file(doc("f1"));
        f.drive.add_comment("c1", Comment::default());
        f.drive.add_activities(
            "f1",
            vec![
                comment_activity("ADDED", at, false),
                comment_activity("ADDED", at - Duration::seconds(5), true),
                comment_activity("EDITED", at - Duration::seconds(1), false),
            ],
        );

        let delivered = f.processor.process_at(&push("change"), now).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(f.sink.messages().len(), 1);
        let stored = f.cursors.get("alice").await.unwrap().unwrap();
        assert_eq!(stored.page_token, "p3");
        assert_eq!(stored.last_activity_at, Some(at));
        assert!(f.drive.calls().contains(&DriveCall::QueryActivity {
            file_id: "f1".into(),
            since: Some(now - Duration::seconds(ACTIVITY_LOOKBACK_SECS)),
        }));
    }

    #[tokio::test]
    async fn activity_query_resumes_from_cursor_time() {
        let f = fixture();
        let now = Utc::now();
        let last = now - Duration::hours(1);
        watch(&f, now + Duration::days(1)).await;
        cursor(&f, "p1", Some(last)).await;
        f.drive.add_changes("p1", vec![file_change(doc("f1"), now)], None, Some("p2"));

        f.processor.process_at(&push("change"), now).await.unwrap();

        assert!(f.drive.calls().contains(&DriveCall::QueryActivity {
            file_id: "f1".into(),
            since: Some(last),
        }));
        let stored = f.cursors.get("alice").await.unwrap().unwrap();
        assert_eq!(stored.last_activity_at, Some(last));
    }

    #[tokio::test]
    async fn new_share_sends_file_shared_notification() {
        let f = fixture();
        let now = Utc::now();
        watch(&f, now + Duration::days(1)).await;
        cursor(&f, "p1", None).await;

        let shared = FileMetadata {
            sharing_user: Some(DriveUser {
                display_name: "Erin".into(),
                ..DriveUser::default()
            }),
            shared_with_me_time: Some(now - Duration::seconds(5)),
            ..doc("f2")
        };
        f.drive.add_file(shared.clone());
        f.drive.add_changes("p1", vec![file_change(shared, now)], None, Some("p2"));

        let delivered = f.processor.process_at(&push("change"), now).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(f.sink.messages()[0].message, "Erin shared an item with you");
        assert!(!f
            .drive
            .calls()
            .iter()
            .any(|c| matches!(c, DriveCall::QueryActivity { .. })));
    }

    #[tokio::test]
    async fn removed_changes_are_skipped() {
        let f = fixture();
        let now = Utc::now();
        watch(&f, now + Duration::days(1)).await;
        cursor(&f, "p1", None).await;
        let mut change = file_change(doc("f1"), now);
        change.removed = true;
        f.drive.add_changes("p1", vec![change], None, Some("p2"));

        assert_eq!(f.processor.process_at(&push("change"), now).await.unwrap(), 0);
        assert_eq!(f.cursors.get("alice").await.unwrap().unwrap().page_token, "p2");
    }

    #[tokio::test]
    async fn list_failure_keeps_cursor() {
        let f = fixture();
        let now = Utc::now();
        watch(&f, now + Duration::days(1)).await;
        cursor(&f, "missing", None).await;

        let result = f.processor.process_at(&push("change"), now).await;

        assert!(matches!(result, Err(ProcessError::Drive(_))));
        assert_eq!(f.cursors.get("alice").await.unwrap().unwrap().page_token, "missing");
    }

    #[test]
    fn share_detection_requires_recent_unviewed_share() {
        let now = Utc::now();
        let shared = FileMetadata {
            sharing_user: Some(DriveUser::default()),
            shared_with_me_time: Some(now),
            ..FileMetadata::default()
        };
        assert!(is_new_share(&shared, now + Duration::seconds(30)));
        assert!(!is_new_share(&shared, now + Duration::minutes(5)));

        let viewed = FileMetadata {
            viewed_by_me_time: Some(now),
            ..shared.clone()
        };
        assert!(!is_new_share(&viewed, now));

        let own = FileMetadata {
            sharing_user: None,
            ..shared
        };
        assert!(!is_new_share(&own, now));
    }
}
