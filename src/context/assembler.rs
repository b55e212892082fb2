//! Librarian phase: gather repository context into a [`ContextBundle`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{ContextBundle, ContextFileLoader, ImpactGraph, Snippet, SymbolSummary};
use crate::docdex::{ast_node_count, symbol_names, DocdexClient, SearchHit, SearchOptions};
use crate::evidence::{EvidenceCounts, ToolUsage};
use crate::memory::{GoldenSetStore, RunHistoryIndexer};

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub search_limit: usize,
    /// Keyword queries issued in addition to the request itself
    pub max_keyword_queries: usize,
    pub max_focus_files: usize,
    pub max_periphery_files: usize,
    pub golden_examples: usize,
    pub history_examples: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            search_limit: 8,
            max_keyword_queries: 3,
            max_focus_files: 3,
            max_periphery_files: 5,
            golden_examples: 3,
            history_examples: 3,
        }
    }
}

/// Bundle plus the evidence the gate scores.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub bundle: ContextBundle,
    pub evidence: EvidenceCounts,
    pub tool_usage: ToolUsage,
}

pub struct ContextAssembler {
    config: AssemblerConfig,
    loader: ContextFileLoader,
    docdex: Option<Arc<dyn DocdexClient>>,
    golden: Option<Arc<GoldenSetStore>>,
    history: Option<Arc<RunHistoryIndexer>>,
}

impl ContextAssembler {
    pub fn new(config: AssemblerConfig, loader: ContextFileLoader) -> Self {
        Self {
            config,
            loader,
            docdex: None,
            golden: None,
            history: None,
        }
    }

    pub fn with_docdex(mut self, docdex: Arc<dyn DocdexClient>) -> Self {
        self.docdex = Some(docdex);
        self
    }

    pub fn with_golden_set(mut self, store: Arc<GoldenSetStore>) -> Self {
        self.golden = Some(store);
        self
    }

    pub fn with_run_history(mut self, history: Arc<RunHistoryIndexer>) -> Self {
        self.history = Some(history);
        self
    }

    pub async fn assemble(&self, request: &str) -> AssembledContext {
        let mut bundle = ContextBundle::new(request);
        let mut usage = ToolUsage::default();

        bundle.queries.push(request.trim().to_string());
        bundle.queries.extend(
            bundle
                .intent
                .keywords
                .iter()
                .take(self.config.max_keyword_queries)
                .cloned(),
        );

        match &self.docdex {
            Some(docdex) => {
                let hits = self.search_all(docdex.as_ref(), &bundle.queries, &mut usage, &mut bundle.warnings).await;
                bundle.search_hits = hits;
            }
            None => bundle
                .warnings
                .push("docdex unavailable: repository search skipped".to_string()),
        }

        bundle.snippets = bundle
            .search_hits
            .iter()
            .filter_map(|hit| {
                hit.snippet.as_ref().filter(|s| !s.trim().is_empty()).map(|text| Snippet {
                    path: hit.path.clone(),
                    text: text.clone(),
                })
            })
            .collect();
        usage.snippet += bundle.snippets.len();

        let paths: Vec<String> = bundle.search_hits.iter().map(|h| h.path.clone()).collect();
        let focus: Vec<String> = paths.iter().take(self.config.max_focus_files).cloned().collect();
        let periphery: Vec<String> = paths
            .iter()
            .skip(self.config.max_focus_files)
            .take(self.config.max_periphery_files)
            .cloned()
            .collect();

        let loaded_focus = self.loader.load_focus(&focus).await;
        usage.open += loaded_focus.entries.len();
        let loaded_periphery = self.loader.load_periphery(&periphery).await;
        for loaded in [loaded_focus, loaded_periphery] {
            bundle.files.extend(loaded.entries);
            bundle.load_errors.extend(loaded.load_errors);
        }

        if let Some(docdex) = &self.docdex {
            let focus_loaded: Vec<String> = bundle.focus_paths().into_iter().map(str::to_string).collect();
            for path in &focus_loaded {
                bundle.symbols.push(self.symbol_summary(docdex.as_ref(), path, &mut usage).await);
                if let Some(graph) = self.impact_graph(docdex.as_ref(), path, &mut usage).await {
                    bundle.impact.push(graph);
                }
            }
        }

        self.collect_examples(&mut bundle).await;

        let evidence = EvidenceCounts {
            search_hits: bundle.search_hits.len(),
            snippet_count: bundle.snippets.len(),
            symbol_count: bundle.symbols.iter().filter(|s| !s.symbols.is_empty()).count(),
            ast_count: bundle.symbols.iter().filter(|s| s.ast_nodes > 0).count(),
            impact_files: bundle.impact.iter().map(|g| g.affected.len()).sum(),
            warnings: bundle.warnings.clone(),
        };
        tracing::info!(
            "Assembled context: {} hits, {} files, {} warnings",
            evidence.search_hits,
            bundle.files.len(),
            evidence.warnings.len()
        );
        AssembledContext {
            bundle,
            evidence,
            tool_usage: usage,
        }
    }

    /// Run every query, merging hits by path (best score wins), best first.
    async fn search_all(
        &self,
        docdex: &dyn DocdexClient,
        queries: &[String],
        usage: &mut ToolUsage,
        warnings: &mut Vec<String>,
    ) -> Vec<SearchHit> {
        let opts = SearchOptions {
            limit: self.config.search_limit,
            path_prefix: None,
        };
        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for query in queries.iter().filter(|q| !q.is_empty()) {
            usage.search += 1;
            match docdex.search(query, &opts).await {
                Ok(result) => {
                    for hit in result.hits {
                        match merged.get_mut(&hit.path) {
                            Some(existing) if existing.score >= hit.score => {}
                            Some(existing) => *existing = hit,
                            None => {
                                order.push(hit.path.clone());
                                merged.insert(hit.path.clone(), hit);
                            }
                        }
                    }
                }
                Err(e) => warnings.push(format!("docdex search failed for '{}': {}", query, e)),
            }
        }
        let mut hits: Vec<SearchHit> = order.into_iter().filter_map(|p| merged.remove(&p)).collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }

    async fn symbol_summary(&self, docdex: &dyn DocdexClient, path: &str, usage: &mut ToolUsage) -> SymbolSummary {
        let symbols = match docdex.symbols(path).await {
            Ok(payload) => {
                usage.symbols += 1;
                symbol_names(&payload)
            }
            Err(e) => {
                tracing::debug!("No symbols for {}: {}", path, e);
                Vec::new()
            }
        };
        let ast_nodes = match docdex.ast(path).await {
            Ok(payload) => {
                usage.ast += 1;
                ast_node_count(&payload)
            }
            Err(e) => {
                tracing::debug!("No AST for {}: {}", path, e);
                0
            }
        };
        SymbolSummary {
            path: path.to_string(),
            symbols,
            ast_nodes,
        }
    }

    /// Other indexed files that mention `path`'s file stem.
    async fn impact_graph(&self, docdex: &dyn DocdexClient, path: &str, usage: &mut ToolUsage) -> Option<ImpactGraph> {
        let stem = Path::new(path).file_stem()?.to_str()?.to_string();
        if stem.len() < 3 {
            return None;
        }
        usage.impact += 1;
        let opts = SearchOptions {
            limit: self.config.search_limit,
            path_prefix: None,
        };
        match docdex.search(&stem, &opts).await {
            Ok(result) => {
                let mut affected: Vec<String> = result
                    .hits
                    .into_iter()
                    .map(|h| h.path)
                    .filter(|p| p != path)
                    .collect();
                affected.dedup();
                Some(ImpactGraph {
                    path: path.to_string(),
                    affected,
                })
            }
            Err(e) => {
                tracing::debug!("Impact search failed for {}: {}", path, e);
                None
            }
        }
    }

    async fn collect_examples(&self, bundle: &mut ContextBundle) {
        if let Some(golden) = &self.golden {
            match golden.find_examples(&bundle.request, self.config.golden_examples).await {
                Ok(examples) => bundle.golden_examples = examples,
                Err(e) => bundle.warnings.push(format!("golden set unavailable: {}", e)),
            }
        }
        if let Some(history) = &self.history {
            match history.find_similar(&bundle.request, self.config.history_examples).await {
                Ok(examples) => bundle.history_examples = examples,
                Err(e) => bundle.warnings.push(format!("run history unavailable: {}", e)),
            }
        }
    }
}
