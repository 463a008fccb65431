use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    Error, Result,
    worker::{Coordinator, CreateMode, Stat},
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral: bool,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Children ever created per parent, used for sequential names.
    counters: HashMap<String, u64>,
    auth: Vec<(String, Vec<u8>)>,
}

/// An in-process [`Coordinator`] with ZooKeeper semantics: parents must exist,
/// sequential names carry a ten-digit suffix, writes are versioned and
/// ephemeral nodes vanish when the session expires.
///
/// Cloning is not supported; share it behind an `Arc` to simulate several
/// processes talking to one ensemble.
#[derive(Debug)]
pub struct MemoryCoordinator {
    tree: Mutex<Tree>,
    available: AtomicBool,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> Result<&str> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(Error::coordination(format!("invalid path `{path}`")));
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Ok("/"),
        Some((parent, _)) => Ok(parent),
        None => Err(Error::coordination(format!("invalid path `{path}`"))),
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggles reachability. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Drops every ephemeral node, as when the owning session expires.
    pub fn expire_session(&self) {
        self.tree.lock().nodes.retain(|_, node| !node.ephemeral);
    }

    /// Credentials added so far as `(scheme, auth)`.
    pub fn auth(&self) -> Vec<(String, Vec<u8>)> {
        self.tree.lock().auth.clone()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::coordination("connection lost"))
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        self.ensure_available()?;
        self.tree
            .lock()
            .auth
            .push((scheme.to_string(), auth.to_vec()));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.ensure_available()?;
        if path == "/" {
            return Ok(Some(Stat::default()));
        }
        Ok(self.tree.lock().nodes.get(path).map(|node| Stat {
            version: node.version,
        }))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let tree = self.tree.lock();
        if path != "/" && !tree.nodes.contains_key(path) {
            return Err(Error::coordination(format!("no node `{path}`")));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .map(|(node, _)| node)
            .take_while(|node| node.starts_with(&prefix))
            .filter_map(|node| {
                let name = &node[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.ensure_available()?;
        let parent = parent_of(path)?;
        let mut tree = self.tree.lock();
        if parent != "/" && !tree.nodes.contains_key(parent) {
            return Err(Error::coordination(format!("no node `{parent}`")));
        }

        let counter = tree.counters.entry(parent.to_string()).or_default();
        let seq = *counter;
        *counter += 1;
        let actual = if mode.is_sequential() {
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };
        if tree.nodes.contains_key(&actual) {
            return Err(Error::coordination(format!("node `{actual}` exists")));
        }

        tree.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral: mode.is_ephemeral(),
            },
        );
        Ok(actual)
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.ensure_available()?;
        self.tree
            .lock()
            .nodes
            .get(path)
            .map(|node| {
                (
                    node.data.clone(),
                    Stat {
                        version: node.version,
                    },
                )
            })
            .ok_or_else(|| Error::coordination(format!("no node `{path}`")))
    }

    async fn set(&self, path: &str, data: &[u8], version: i32) -> Result<Stat> {
        self.ensure_available()?;
        let mut tree = self.tree.lock();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::coordination(format!("no node `{path}`")))?;
        if version != -1 && version != node.version {
            return Err(Error::coordination(format!(
                "bad version for `{path}`: expected {}, got {version}",
                node.version
            )));
        }
        node.data = data.to_vec();
        node.version += 1;
        Ok(Stat {
            version: node.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parent_must_exist() {
        let zk = MemoryCoordinator::new();
        assert!(matches!(
            zk.create("/a/b", b"", CreateMode::Persistent).await,
            Err(Error::Coordination { .. })
        ));
        zk.create("/a", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            zk.create("/a/b", b"", CreateMode::Persistent).await,
            Ok("/a/b".to_string())
        );
        assert!(zk.create("/a", b"", CreateMode::Persistent).await.is_err());
    }

    #[tokio::test]
    async fn sequential_names_count_per_parent() {
        let zk = MemoryCoordinator::new();
        zk.create("/a", b"", CreateMode::Persistent).await.unwrap();
        zk.create("/b", b"", CreateMode::Persistent).await.unwrap();

        let first = zk
            .create("/a/n-", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = zk
            .create("/a/n-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let other = zk
            .create("/b/n-", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(first, "/a/n-0000000000");
        assert_eq!(second, "/a/n-0000000001");
        assert_eq!(other, "/b/n-0000000000");

        assert_eq!(
            zk.children("/a").await.unwrap(),
            ["n-0000000000", "n-0000000001"]
        );
        assert_eq!(zk.children("/").await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn set_is_versioned() {
        let zk = MemoryCoordinator::new();
        zk.create("/a", b"one", CreateMode::Persistent).await.unwrap();

        assert_eq!(zk.set("/a", b"two", 0).await, Ok(Stat { version: 1 }));
        assert!(zk.set("/a", b"stale", 0).await.is_err());
        assert_eq!(zk.set("/a", b"any", -1).await, Ok(Stat { version: 2 }));
        assert_eq!(
            zk.get("/a").await,
            Ok((b"any".to_vec(), Stat { version: 2 }))
        );
    }

    #[tokio::test]
    async fn expired_session_drops_ephemeral_nodes() {
        let zk = MemoryCoordinator::new();
        zk.create("/a", b"", CreateMode::Persistent).await.unwrap();
        zk.create("/a/e", b"", CreateMode::Ephemeral).await.unwrap();

        zk.expire_session();
        assert_eq!(zk.exists("/a/e").await, Ok(None));
        assert!(zk.exists("/a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_fails_every_call() {
        let zk = MemoryCoordinator::new();
        zk.set_available(false);
        assert!(matches!(
            zk.exists("/").await,
            Err(Error::Coordination { .. })
        ));
        assert!(zk.add_auth("digest", b"u:p").await.is_err());
        assert!(zk.auth().is_empty());
    }
}
