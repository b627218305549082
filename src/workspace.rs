//! Workspace discovery and configuration.
//!
//! A workspace is any directory tree with a `.notegraph/` directory at its
//! root, holding `navigation.yaml`, `schema.yaml` and `templates/<id>.md`.
//! Files under `.notegraph/` belong to the `config` namespace and are
//! governed by a built-in navigation tree and schema; everything else is
//! `content`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::navigation::{NavigationItem, NavigationTree, ResolvedItem};
use crate::store::Vfs;
use crate::template::Template;

pub const WORKSPACE_DIR: &str = ".notegraph";
pub const NAVIGATION_FILE: &str = "navigation.yaml";
pub const SCHEMA_FILE: &str = "schema.yaml";
pub const TEMPLATES_DIR: &str = "templates";

pub const CONFIG_NAMESPACE: &str = "config";
pub const CONTENT_NAMESPACE: &str = "content";

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    /// Navigation tree per namespace.
    navigation: BTreeMap<String, NavigationTree>,
    /// Templates referenced by navigation items, by id.
    templates: BTreeMap<String, Template>,
    /// Raw schema source, kept for seeding the graph store.
    schema_source: Option<String>,
}

/// Walk up from `start` to the nearest directory containing `.notegraph/`.
pub async fn find_root(vfs: &dyn Vfs, start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if vfs.exists(&dir.join(WORKSPACE_DIR)).await {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// The built-in navigation governing the configuration files themselves.
fn config_navigation() -> NavigationTree {
    let items: Vec<NavigationItem> = serde_yaml::from_str(
        r#"
- path: .notegraph/navigation.yaml
- path: .notegraph/schema.yaml
- path: .notegraph/templates/{id}.md
"#,
    )
    .unwrap_or_default();
    NavigationTree::from_items(items).unwrap_or_default()
}

impl Workspace {
    /// Load a workspace rooted at `root`. Missing configuration files leave
    /// the corresponding layer empty rather than failing the whole load; a
    /// malformed navigation file is an error, since nothing can be resolved
    /// without it.
    pub async fn load(vfs: &dyn Vfs, root: &Path) -> CoreResult<Workspace> {
        let config_dir = root.join(WORKSPACE_DIR);

        let navigation_path = config_dir.join(NAVIGATION_FILE);
        let content_tree = if vfs.exists(&navigation_path).await {
            NavigationTree::load(&vfs.read_to_string(&navigation_path).await?)?
        } else {
            warn!(root = %root.display(), "no navigation.yaml; nothing will resolve");
            NavigationTree::default()
        };

        let schema_path = config_dir.join(SCHEMA_FILE);
        let schema_source = if vfs.exists(&schema_path).await {
            Some(vfs.read_to_string(&schema_path).await?)
        } else {
            None
        };

        let mut templates = BTreeMap::new();
        for resolved in content_tree.items() {
            let Some(id) = &resolved.item.template else {
                continue;
            };
            if templates.contains_key(id) {
                continue;
            }
            let path = config_dir.join(TEMPLATES_DIR).join(format!("{id}.md"));
            let source = vfs.read_to_string(&path).await.map_err(|_| {
                CoreError::NavigationItemNotFound(format!("template '{id}'"))
            })?;
            templates.insert(id.clone(), Template::parse(id, &source)?);
        }

        let mut navigation = BTreeMap::new();
        navigation.insert(CONTENT_NAMESPACE.to_string(), content_tree);
        navigation.insert(CONFIG_NAMESPACE.to_string(), config_navigation());

        info!(
            root = %root.display(),
            templates = templates.len(),
            "workspace loaded"
        );
        Ok(Workspace {
            root: root.to_path_buf(),
            navigation,
            templates,
            schema_source,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace-relative path with forward slashes, or `None` when the file
    /// lies outside the workspace.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str().unwrap_or_default())
            .collect();
        Some(parts.join("/"))
    }

    pub fn namespace_for(relative_path: &str) -> &'static str {
        if relative_path == WORKSPACE_DIR
            || relative_path.starts_with(concat!(".notegraph", "/"))
        {
            CONFIG_NAMESPACE
        } else {
            CONTENT_NAMESPACE
        }
    }

    pub fn navigation(&self, namespace: &str) -> Option<&NavigationTree> {
        self.navigation.get(namespace)
    }

    /// The rule governing a workspace-relative path, with its namespace.
    pub fn find_rule(&self, relative_path: &str) -> Option<(&'static str, &ResolvedItem)> {
        let namespace = Workspace::namespace_for(relative_path);
        let tree = self.navigation.get(namespace)?;
        tree.find_item_by_path(relative_path)
            .map(|item| (namespace, item))
    }

    pub fn template(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn schema_source(&self) -> Option<&str> {
        self.schema_source.as_deref()
    }

    /// Absolute path of a workspace-relative path.
    pub fn absolute_path(&self, relative_path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in relative_path.split('/') {
            out.push(part);
        }
        out
    }

    /// Absolute path of a template file.
    pub fn template_path(&self, id: &str) -> PathBuf {
        self.root
            .join(WORKSPACE_DIR)
            .join(TEMPLATES_DIR)
            .join(format!("{id}.md"))
    }
}
