use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, info, warn};

// Use the library crate for all modules
use notegraph_lsp::cache::{DocumentCache, EntityContextCache};
use notegraph_lsp::context::{build_document_context_with, DocumentContext};
use notegraph_lsp::features;
use notegraph_lsp::parser::{format_for_path, ParsedDocument};
use notegraph_lsp::schema::Schema;
use notegraph_lsp::store::{GraphStore, InMemoryGraph, StdVfs};
use notegraph_lsp::sync::sync_document;
use notegraph_lsp::workspace::{find_root, Workspace, CONFIG_NAMESPACE, CONTENT_NAMESPACE};

// ============================================================================
// PART 1: Core Language Server Implementation
// ============================================================================

struct NotegraphLanguageServer {
    client: Client,
    /// Open document buffers: full text plus the editor's version counter.
    documents: Arc<RwLock<HashMap<Url, (String, i32)>>>,
    workspace: Arc<RwLock<Option<Arc<Workspace>>>>,
    store: Arc<InMemoryGraph>,
    parsed: Mutex<DocumentCache>,
    contexts: Mutex<EntityContextCache>,
}

impl NotegraphLanguageServer {
    fn new(client: Client) -> NotegraphLanguageServer {
        NotegraphLanguageServer {
            client,
            documents: Arc::new(RwLock::new(HashMap::new())),
            workspace: Arc::new(RwLock::new(None)),
            store: Arc::new(InMemoryGraph::new()),
            parsed: Mutex::new(DocumentCache::new()),
            contexts: Mutex::new(EntityContextCache::new()),
        }
    }

    /// (Re)load the workspace configuration and seed the graph schema.
    async fn load_workspace(&self, start: &Path) {
        let Some(root) = find_root(&StdVfs, start).await else {
            warn!(start = %start.display(), "no .notegraph directory found; features disabled");
            return;
        };
        match Workspace::load(&StdVfs, &root).await {
            Ok(workspace) => {
                if let Some(source) = workspace.schema_source() {
                    match Schema::parse(source) {
                        Ok(schema) => {
                            self.store.set_schema(CONTENT_NAMESPACE, schema).await;
                        }
                        Err(err) => {
                            warn!(%err, "schema.yaml did not parse; content fields untyped");
                        }
                    }
                }
                *self.workspace.write().await = Some(Arc::new(workspace));
            }
            Err(err) => {
                warn!(%err, root = %root.display(), "workspace load failed");
                self.client
                    .show_message(
                        MessageType::WARNING,
                        format!("notegraph workspace failed to load: {err}"),
                    )
                    .await;
            }
        }
        self.parsed.lock().await.invalidate_all();
        self.contexts.lock().await.invalidate_all();
    }

    /// The parsed form of an open document, cached per editor version.
    async fn parsed_document(&self, uri: &Url) -> Option<Arc<ParsedDocument>> {
        let (text, version) = self.documents.read().await.get(uri).cloned()?;
        if let Some(doc) = self.parsed.lock().await.get(uri, version) {
            return Some(doc);
        }
        let format = format_for_path(uri.path())?;
        let doc = match ParsedDocument::parse(format, text, version) {
            Ok(doc) => Arc::new(doc),
            Err(err) => {
                debug!(%uri, %err, "document did not parse");
                return None;
            }
        };
        self.parsed
            .lock()
            .await
            .insert(uri.clone(), version, Arc::clone(&doc));
        Some(doc)
    }

    /// Assemble the per-document context every feature works from. Returns
    /// `None` for documents outside the workspace's governance; requests then
    /// degrade to empty responses rather than errors.
    async fn document_context(&self, uri: &Url) -> Option<DocumentContext> {
        let workspace = self.workspace.read().await.clone()?;
        let doc = self.parsed_document(uri).await?;
        let graph_version = match self.store.version().await {
            Ok(version) => version,
            Err(err) => {
                debug!(%err, "graph version unavailable");
                return None;
            }
        };

        let cached = self
            .contexts
            .lock()
            .await
            .get(uri, doc.version, graph_version);
        let had_cached = cached.is_some();
        let doc_version = doc.version;

        let ctx =
            match build_document_context_with(&workspace, &*self.store, uri, doc, cached).await {
                Ok(ctx) => ctx,
                Err(err) => {
                    debug!(%uri, %err, "no document context");
                    return None;
                }
            };
        if !had_cached {
            self.contexts.lock().await.insert(
                uri.clone(),
                doc_version,
                graph_version,
                Arc::clone(&ctx.entity_context),
                Arc::clone(&ctx.projection_contexts),
            );
        }
        Some(ctx)
    }

    /// Recompute and publish diagnostics for one document.
    async fn refresh_diagnostics(&self, uri: &Url) {
        let version = self.documents.read().await.get(uri).map(|(_, v)| *v);
        let diagnostics = match self.document_context(uri).await {
            Some(ctx) => features::diagnostics(&ctx),
            None => Vec::new(),
        };
        self.client
            .publish_diagnostics(uri.clone(), diagnostics, version)
            .await;
    }

    /// Whether a saved file is part of the workspace configuration.
    async fn is_config_file(&self, uri: &Url) -> bool {
        let Some(workspace) = self.workspace.read().await.clone() else {
            return false;
        };
        let Ok(path) = uri.to_file_path() else {
            return false;
        };
        workspace
            .relative_path(&path)
            .map(|rel| Workspace::namespace_for(&rel) == CONFIG_NAMESPACE)
            .unwrap_or(false)
    }

    fn cursor_offset(doc_text: &str, position: Position) -> usize {
        features::position_to_offset(doc_text, position)
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for NotegraphLanguageServer {
    async fn initialize(&self, params: InitializeParams) -> jsonrpc::Result<InitializeResult> {
        info!("notegraph LSP: initialize");

        if let Some(root_uri) = params.root_uri {
            if let Ok(path) = root_uri.to_file_path() {
                self.load_workspace(&path).await;
            }
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        will_save: None,
                        will_save_wait_until: None,
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(false),
                        })),
                    },
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![":".to_string(), " ".to_string()]),
                    ..Default::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
                inlay_hint_provider: Some(OneOf::Left(true)),
                diagnostic_provider: Some(DiagnosticServerCapabilities::Options(
                    DiagnosticOptions {
                        identifier: Some("notegraph".to_string()),
                        inter_file_dependencies: false,
                        workspace_diagnostics: false,
                        work_done_progress_options: Default::default(),
                    },
                )),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let loaded = self.workspace.read().await.is_some();
        info!(workspace = loaded, "notegraph LSP: initialized");
    }

    async fn shutdown(&self) -> jsonrpc::Result<()> {
        info!("notegraph LSP: shutting down");
        self.documents.write().await.clear();
        self.parsed.lock().await.invalidate_all();
        self.contexts.lock().await.invalidate_all();
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        debug!(%uri, "did_open");
        self.documents.write().await.insert(
            uri.clone(),
            (params.text_document.text, params.text_document.version),
        );
        self.refresh_diagnostics(&uri).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;
        // Full sync: the last change carries the whole document.
        if let Some(change) = params.content_changes.into_iter().last() {
            self.documents
                .write()
                .await
                .insert(uri.clone(), (change.text, version));
            self.refresh_diagnostics(&uri).await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        info!(%uri, "did_save");

        if self.is_config_file(&uri).await {
            // Saving navigation, schema or a template changes what every
            // other document means; reload and start from scratch.
            if let Some(workspace) = self.workspace.read().await.clone() {
                let root = workspace.root().to_path_buf();
                self.load_workspace(&root).await;
            }
            self.refresh_diagnostics(&uri).await;
            return;
        }

        let Some(ctx) = self.document_context(&uri).await else {
            return;
        };
        match sync_document(&ctx, &*self.store).await {
            Ok(report) => {
                if !report.is_empty() {
                    info!(
                        %uri,
                        creates = report.creates,
                        updates = report.updates,
                        "document synced"
                    );
                }
            }
            Err(err) => {
                warn!(%uri, %err, "sync failed");
                self.client
                    .show_message(MessageType::WARNING, format!("notegraph sync: {err}"))
                    .await;
            }
        }
        // The graph may have moved; re-derive diagnostics and hints.
        self.refresh_diagnostics(&uri).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        debug!(%uri, "did_close");
        self.documents.write().await.remove(&uri);
        self.parsed.lock().await.invalidate(&uri);
        self.contexts.lock().await.invalidate(&uri);
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn diagnostic(
        &self,
        params: DocumentDiagnosticParams,
    ) -> jsonrpc::Result<DocumentDiagnosticReportResult> {
        let uri = params.text_document.uri;
        let items = match self.document_context(&uri).await {
            Some(ctx) => features::diagnostics(&ctx),
            None => Vec::new(),
        };
        Ok(DocumentDiagnosticReportResult::Report(
            DocumentDiagnosticReport::Full(RelatedFullDocumentDiagnosticReport {
                related_documents: None,
                full_document_diagnostic_report: FullDocumentDiagnosticReport {
                    result_id: None,
                    items,
                },
            }),
        ))
    }

    async fn hover(&self, params: HoverParams) -> jsonrpc::Result<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let Some(ctx) = self.document_context(&uri).await else {
            return Ok(None);
        };
        let offset = Self::cursor_offset(
            &ctx.doc.text,
            params.text_document_position_params.position,
        );
        Ok(features::hover(&ctx, offset))
    }

    async fn completion(
        &self,
        params: CompletionParams,
    ) -> jsonrpc::Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri;
        let Some(ctx) = self.document_context(&uri).await else {
            return Ok(None);
        };
        let offset = Self::cursor_offset(&ctx.doc.text, params.text_document_position.position);
        let items = features::completions(&ctx, &*self.store, offset).await;
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CompletionResponse::Array(items)))
        }
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> jsonrpc::Result<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let Some(workspace) = self.workspace.read().await.clone() else {
            return Ok(None);
        };
        let Some(ctx) = self.document_context(&uri).await else {
            return Ok(None);
        };
        let offset = Self::cursor_offset(
            &ctx.doc.text,
            params.text_document_position_params.position,
        );
        let location = features::goto_definition(&ctx, &*self.store, &workspace, offset).await;
        Ok(location.map(GotoDefinitionResponse::Scalar))
    }

    async fn code_action(
        &self,
        params: CodeActionParams,
    ) -> jsonrpc::Result<Option<CodeActionResponse>> {
        let uri = params.text_document.uri;
        let Some(ctx) = self.document_context(&uri).await else {
            return Ok(None);
        };
        let actions = features::code_actions(&ctx, &params.range);
        if actions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(actions))
        }
    }

    async fn inlay_hint(&self, params: InlayHintParams) -> jsonrpc::Result<Option<Vec<InlayHint>>> {
        let uri = params.text_document.uri;
        let Some(ctx) = self.document_context(&uri).await else {
            return Ok(None);
        };
        Ok(Some(features::inlay_hints(&ctx)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO; override with RUST_LOG. Logs go to stderr so stdout
    // stays clean for the LSP wire protocol.
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("notegraph language server starting");

    let (service, socket) = LspService::new(NotegraphLanguageServer::new);

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    Server::new(stdin, stdout, socket).serve(service).await;

    info!("notegraph language server stopped");
    Ok(())
}
