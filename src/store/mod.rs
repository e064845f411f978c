use crate::errors::{AppError, AppResult};
use crate::models::{Document, Event, Reminder, Role, StoreDocument, StoreMeta, User, WorkplanItem};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

const WRITE_QUEUE_DEPTH: usize = 256;

/// An entity kept in one array of the store document.
pub trait Record: Clone + Send + Sync + 'static {
    const LABEL: &'static str;

    fn id(&self) -> u64;
    fn collection(document: &StoreDocument) -> &Vec<Self>;
    fn collection_mut(document: &mut StoreDocument) -> &mut Vec<Self>;
    /// Advances the matching `_meta` counter and returns the new id.
    fn next_id(meta: &mut StoreMeta) -> u64;
    fn touch(&mut self, now: DateTime<Utc>);
}

macro_rules! timestamped_record {
    ($ty:ty, $label:literal, $field:ident, $counter:ident) => {
        impl Record for $ty {
            const LABEL: &'static str = $label;

            fn id(&self) -> u64 {
                self.id
            }

            fn collection(document: &StoreDocument) -> &Vec<Self> {
                &document.$field
            }

            fn collection_mut(document: &mut StoreDocument) -> &mut Vec<Self> {
                &mut document.$field
            }

            fn next_id(meta: &mut StoreMeta) -> u64 {
                meta.$counter += 1;
                meta.$counter
            }

            fn touch(&mut self, now: DateTime<Utc>) {
                self.updated_at = now;
            }
        }
    };
}

timestamped_record!(Event, "event", events, last_event_id);
timestamped_record!(Document, "document", documents, last_document_id);
timestamped_record!(Reminder, "reminder", reminders, last_reminder_id);
timestamped_record!(WorkplanItem, "workplan item", workplan, last_workplan_id);

impl Record for User {
    const LABEL: &'static str = "user";

    fn id(&self) -> u64 {
        self.id
    }

    fn collection(document: &StoreDocument) -> &Vec<Self> {
        &document.users
    }

    fn collection_mut(document: &mut StoreDocument) -> &mut Vec<Self> {
        &mut document.users
    }

    fn next_id(meta: &mut StoreMeta) -> u64 {
        meta.last_user_id += 1;
        meta.last_user_id
    }

    fn touch(&mut self, _now: DateTime<Utc>) {}
}

/// Result of a transaction body: the value handed back to the caller and
/// whether the document must be written.
pub struct Mutation<T> {
    value: T,
    dirty: bool,
}

impl<T> Mutation<T> {
    pub fn write(value: T) -> Self {
        Self { value, dirty: true }
    }

    pub fn skip(value: T) -> Self {
        Self { value, dirty: false }
    }
}

type Transaction = Box<dyn FnOnce(&mut StoreDocument) -> bool + Send>;

enum WriteCommand {
    Transact {
        apply: Transaction,
        done: oneshot::Sender<AppResult<()>>,
    },
    Replace {
        document: Box<StoreDocument>,
        done: oneshot::Sender<AppResult<()>>,
    },
}

/// Single JSON document store. Reads go straight to the committed file;
/// every write is executed by one writer task, in arrival order.
#[derive(Clone)]
pub struct JsonStore {
    path: Arc<PathBuf>,
    writer: mpsc::Sender<WriteCommand>,
}

impl JsonStore {
    /// Must be called from within a tokio runtime: the writer task is spawned here.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }

        let (writer, receiver) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(writer_loop(path.clone(), receiver));

        Ok(Self {
            path: Arc::new(path),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: an unreadable or corrupt file yields an empty document.
    pub async fn load(&self) -> StoreDocument {
        read_document(&self.path).await
    }

    pub async fn save(&self, document: StoreDocument) -> AppResult<()> {
        let (done, done_rx) = oneshot::channel();
        self.writer
            .send(WriteCommand::Replace {
                document: Box::new(document),
                done,
            })
            .await
            .map_err(|_| writer_gone())?;
        done_rx.await.map_err(|_| writer_gone())?
    }

    /// Runs `apply` against a freshly loaded document inside the writer task
    /// and persists the result when the body asks for it.
    pub async fn transact<T, F>(&self, apply: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDocument) -> Mutation<T> + Send + 'static,
    {
        let (value_tx, value_rx) = oneshot::channel();
        let (done, done_rx) = oneshot::channel();
        let apply: Transaction = Box::new(move |document| {
            let Mutation { value, dirty } = apply(document);
            let _ = value_tx.send(value);
            dirty
        });

        self.writer
            .send(WriteCommand::Transact { apply, done })
            .await
            .map_err(|_| writer_gone())?;
        done_rx.await.map_err(|_| writer_gone())??;
        value_rx.await.map_err(|_| writer_gone())
    }

    pub async fn all<R: Record>(&self) -> Vec<R> {
        let document = self.load().await;
        R::collection(&document).clone()
    }

    pub async fn get<R: Record>(&self, id: u64) -> Option<R> {
        let document = self.load().await;
        R::collection(&document)
            .iter()
            .find(|record| record.id() == id)
            .cloned()
    }

    pub async fn create<R, F>(&self, build: F) -> AppResult<R>
    where
        R: Record,
        F: FnOnce(u64, DateTime<Utc>) -> R + Send + 'static,
    {
        let record = self
            .transact(move |document| {
                let id = R::next_id(&mut document.meta);
                let record = build(id, Utc::now());
                R::collection_mut(document).push(record.clone());
                Mutation::write(record)
            })
            .await?;
        tracing::debug!(kind = R::LABEL, id = record.id(), "record created");
        Ok(record)
    }

    /// Applies `change` and returns the updated record with whatever the
    /// closure produced. `None` without writing when no record has this id.
    pub async fn update<R, T, F>(&self, id: u64, change: F) -> AppResult<Option<(R, T)>>
    where
        R: Record,
        T: Send + 'static,
        F: FnOnce(&mut R) -> T + Send + 'static,
    {
        self.transact(move |document| {
            let Some(record) = R::collection_mut(document)
                .iter_mut()
                .find(|record| record.id() == id)
            else {
                return Mutation::skip(None);
            };
            let output = change(record);
            record.touch(Utc::now());
            Mutation::write(Some((record.clone(), output)))
        })
        .await
    }

    /// Returns the removed record; a missing id leaves the file untouched.
    pub async fn delete<R: Record>(&self, id: u64) -> AppResult<Option<R>> {
        self.transact(move |document| {
            let records = R::collection_mut(document);
            match records.iter().position(|record| record.id() == id) {
                Some(index) => Mutation::write(Some(records.remove(index))),
                None => Mutation::skip(None),
            }
        })
        .await
    }

    pub async fn user_by_username(&self, username: &str) -> Option<User> {
        let document = self.load().await;
        document
            .users
            .into_iter()
            .find(|user| user.username == username)
    }

    pub async fn user_by_id(&self, id: u64) -> Option<User> {
        self.get::<User>(id).await
    }

    pub async fn has_users(&self) -> bool {
        !self.load().await.users.is_empty()
    }

    /// First-boot seeding; a no-op when any user already exists.
    pub async fn seed_admin_if_empty(&self, username: String, password_hash: String) -> AppResult<Option<User>> {
        self.transact(move |document| {
            if !document.users.is_empty() {
                return Mutation::skip(None);
            }
            let user = User {
                id: User::next_id(&mut document.meta),
                username,
                password: password_hash,
                role: Role::Admin,
                created_at: Utc::now(),
            };
            document.users.push(user.clone());
            Mutation::write(Some(user))
        })
        .await
    }

    /// True when the committed file is absent (fresh install) or parses.
    pub async fn probe(&self) -> bool {
        match tokio::fs::read(self.path.as_path()).await {
            Ok(bytes) => serde_json::from_slice::<StoreDocument>(&bytes).is_ok(),
            Err(err) => err.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

async fn writer_loop(path: PathBuf, mut receiver: mpsc::Receiver<WriteCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriteCommand::Transact { apply, done } => {
                let mut document = read_document(&path).await;
                let result = if apply(&mut document) {
                    persist(&path, &document).await
                } else {
                    Ok(())
                };
                let _ = done.send(result);
            }
            WriteCommand::Replace { document, done } => {
                let _ = done.send(persist(&path, &document).await);
            }
        }
    }
    tracing::debug!(path = %path.display(), "store writer stopped");
}

async fn read_document(path: &Path) -> StoreDocument {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to load store, using default structure");
            return StoreDocument::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(document) => document,
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to parse store, using default structure");
            StoreDocument::default()
        }
    }
}

async fn persist(path: &Path, document: &StoreDocument) -> AppResult<()> {
    let result = write_atomically(path, document).await;
    if let Err(error) = &result {
        tracing::error!(path = %path.display(), error = %error, "failed to save store");
    }
    result
}

async fn write_atomically(path: &Path, document: &StoreDocument) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(document)?;
    let tmp_path = temp_path(path);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

fn writer_gone() -> AppError {
    AppError::Internal("store writer is not running".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(id: u64, now: DateTime<Utc>, title: &str) -> Event {
        Event {
            id,
            title: title.to_string(),
            short_description: "A fun evening of music".to_string(),
            full_description: "A description long enough to pass".to_string(),
            date: "2025-12-01".to_string(),
            image: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> JsonStore {
        JsonStore::open(dir.path().join("data").join("db.json")).expect("open store")
    }

    #[tokio::test]
    async fn missing_or_corrupt_file_loads_default_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        assert_eq!(store.load().await, StoreDocument::default());
        assert!(store.probe().await);

        std::fs::write(store.path(), b"{not json").expect("write corrupt file");
        assert_eq!(store.load().await, StoreDocument::default());
        assert!(!store.probe().await);
    }

    #[tokio::test]
    async fn concurrent_creates_receive_distinct_increasing_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        let mut handles = Vec::new();
        for n in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create(move |id, now| sample_event(id, now, &format!("Event {n}")))
                    .await
                    .expect("create")
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.expect("join"));
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=25).collect::<Vec<u64>>());

        let stored = store.all::<Event>().await;
        assert_eq!(stored.len(), 25);
        assert_eq!(store.load().await.meta.last_event_id, 25);
        assert!(!temp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn ids_are_never_reused_after_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        let first = store.create(|id, now| sample_event(id, now, "First")).await.expect("first");
        let removed = store.delete::<Event>(first.id).await.expect("delete");
        assert_eq!(removed.map(|event| event.id), Some(first.id));

        let second = store.create(|id, now| sample_event(id, now, "Second")).await.expect("second");
        assert_eq!(second.id, first.id + 1);
    }

    #[tokio::test]
    async fn deleting_missing_id_leaves_file_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store.create(|id, now| sample_event(id, now, "Kept")).await.expect("create");

        let before = std::fs::read(store.path()).expect("read before");
        let removed = store.delete::<Event>(999).await.expect("delete missing");
        assert!(removed.is_none());
        let after = std::fs::read(store.path()).expect("read after");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn update_touches_updated_at_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let created = store.create(|id, now| sample_event(id, now, "Before")).await.expect("create");

        let (updated, ()) = store
            .update(created.id, |event: &mut Event| event.title = "After".to_string())
            .await
            .expect("update")
            .expect("record exists");
        assert_eq!(updated.title, "After");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);

        let missing = store
            .update(404, |event: &mut Event| event.title = "Nope".to_string())
            .await
            .expect("update missing");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn admin_seed_runs_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        let seeded = store
            .seed_admin_if_empty("admin".to_string(), "hash".to_string())
            .await
            .expect("seed");
        assert_eq!(seeded.as_ref().map(|user| user.role), Some(Role::Admin));

        let again = store
            .seed_admin_if_empty("other".to_string(), "hash".to_string())
            .await
            .expect("second seed");
        assert!(again.is_none());
        assert!(store.user_by_username("admin").await.is_some());
        assert!(store.user_by_username("other").await.is_none());
        assert_eq!(store.user_by_id(1).await.map(|user| user.username), Some("admin".to_string()));
    }

    #[tokio::test]
    async fn save_replaces_whole_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let mut document = StoreDocument::default();
        document.meta.last_reminder_id = 9;
        store.save(document.clone()).await.expect("save");
        assert_eq!(store.load().await, document);
    }
}
