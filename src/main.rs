use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

const MARKDOWN_LINK_FINDER: &str = r"\[([^\]]*)\]\(([^)]*\.md)\)";
const LINK_FINDER: &str = r"\[([^\]]+)\]\(([^)]+)\)";
const META_HEADER_FINDER: &str = r"(?s)\A---\n(.*?)\n---";
const BACKLINKS_HEADING: &str = "# Backlinks";

const META_FIELDS: [&str; 8] = [
    "ID",
    "TITLE",
    "DESCRIPTION",
    "PUBLISHED",
    "DATE",
    "TAGS",
    "EDITOR",
    "DATECREATED",
];

const LEDGER_COLUMNS: [&str; 8] = [
    "source_file",
    "source_title",
    "target_file",
    "target_title",
    "link_text",
    "status",
    "hierarchy_level",
    "link_type",
];

/// mdxref - Cross-reference markdown documents with backlinks and link graphs
#[derive(Parser)]
#[command(name = "mdxref")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".mdxref.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Logging level
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Log file path (logs go to stderr if not set)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a folder, inject backlinks into linked documents, write the link ledger
    Link {
        /// Root folder to scan for markdown files
        path: PathBuf,

        /// Ledger CSV output path (default: <root>/backlinks.csv)
        #[arg(short, long)]
        ledger: Option<PathBuf>,

        /// Glob patterns to exclude (can be repeated)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Resolve everything but write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Scan and resolve links without touching any document
    Report {
        /// Root folder to scan for markdown files
        path: PathBuf,

        /// Ledger CSV output path (default: <root>/backlinks.csv)
        #[arg(short, long)]
        ledger: Option<PathBuf>,

        /// Glob patterns to exclude (can be repeated)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Print ledger entries as JSON instead of writing the CSV
        #[arg(long)]
        json: bool,
    },

    /// Render a Mermaid flowchart from a link ledger
    Graph {
        /// Ledger CSV produced by `link` or `report`
        csv: PathBuf,

        /// Markdown file receiving the chart (stdout if not set)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Core data model

#[derive(Debug, Clone, PartialEq)]
struct MdLink {
    text: String,
    target: String,
}

/// What a raw link target turned out to be once resolved against the scan root.
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    /// A file inside the scan root, keyed by its root-relative path
    Internal(String),
    /// An http(s) URL, opaque
    Url,
    /// Resolves to nothing on disk; carries the normalized miss for logging
    Broken(String),
    /// Exists on disk but outside the scan root
    OutsideRoot(String),
}

#[derive(Debug, Clone)]
struct ResolvedLink {
    text: String,
    target: String,
    resolution: Resolution,
}

/// Front-matter fields. Every recognized field is always present in the map;
/// `None` means the document never declared it, `Some("")` means declared empty.
#[derive(Debug, Clone, Default)]
struct Metadata {
    fields: BTreeMap<String, Option<String>>,
    tags: Vec<String>,
}

impl Metadata {
    fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_deref())
    }
}

#[derive(Debug)]
struct Document {
    path: PathBuf,
    /// Root-relative path, unique across the corpus; the join key between documents
    rel_path: String,
    title: String,
    meta: Metadata,
    content: String,
    /// Main-body links, resolved
    links: Vec<ResolvedLink>,
    /// Entries currently declared in the Backlinks section, as written
    backlinks: Vec<MdLink>,
    backlink_targets: Vec<String>,
    /// Entries the crosswalk decided to inject, in discovery order
    added: Vec<(String, String)>,
    level: i32,
    needs_update: bool,
}

struct Corpus {
    root: PathBuf,
    docs: BTreeMap<String, Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum LinkStatus {
    Valid,
    Broken,
    OutsideRoot,
}

impl LinkStatus {
    fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Valid => "valid",
            LinkStatus::Broken => "broken",
            LinkStatus::OutsideRoot => "outside-root",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
enum LinkType {
    Original,
    Backlink,
}

impl LinkType {
    fn as_str(self) -> &'static str {
        match self {
            LinkType::Original => "original",
            LinkType::Backlink => "backlink",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntry {
    source_file: String,
    source_title: String,
    target_file: String,
    target_title: String,
    link_text: String,
    status: LinkStatus,
    hierarchy_level: i32,
    link_type: LinkType,
}

struct CrosswalkReport {
    ledger: Vec<LedgerEntry>,
    /// Keys of documents that gained at least one backlink entry
    updated: Vec<String>,
}

struct PipelineOutcome {
    corpus: Corpus,
    report: CrosswalkReport,
    scanned: usize,
    load_failures: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct Config {
    scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ScanConfig {
    exclude: Vec<String>,
    ledger: Option<String>,
}

struct GraphLink {
    source: String,
    target: String,
    status: String,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Link { path, ledger, exclude, dry_run } => {
            cmd_link(&path, ledger.as_deref(), &exclude, dry_run, &config, cli.quiet)
        }
        Commands::Report { path, ledger, exclude, json } => {
            cmd_report(&path, ledger.as_deref(), &exclude, json, &config, cli.quiet)
        }
        Commands::Graph { csv, output } => cmd_graph(&csv, output.as_deref(), cli.quiet),
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn cmd_link(
    path: &Path,
    ledger: Option<&Path>,
    exclude: &[String],
    dry_run: bool,
    config: &Config,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    if !quiet {
        println!("{} {}", "Crosswalking".cyan().bold(), path.display());
    }

    let outcome = run_crosswalk(path, exclude, config)?;
    let ledger_path = resolve_ledger_path(&outcome.corpus.root, ledger, config);

    let mut updated = 0;
    let mut write_failures = 0;

    if !dry_run {
        for key in &outcome.report.updated {
            let doc = match outcome.corpus.docs.get(key) {
                Some(doc) => doc,
                None => continue,
            };
            match persist_document(doc) {
                Ok(true) => {
                    log::info!(
                        "added {} backlinks to {}",
                        doc.added.len(),
                        doc.path.display()
                    );
                    updated += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("failed to write {}: {}", doc.path.display(), e);
                    write_failures += 1;
                }
            }
        }
        write_ledger(&ledger_path, &outcome.report.ledger)?;
    }

    let elapsed = start.elapsed();
    let failed = outcome.load_failures + write_failures;

    if !quiet {
        println!();
        println!("{}", "Crosswalk Summary".green().bold());
        println!("  Documents scanned:  {}", outcome.scanned.to_string().cyan());
        println!(
            "  Links recorded:     {}",
            outcome.report.ledger.len().to_string().cyan()
        );
        if dry_run {
            println!(
                "  Would update:       {}",
                outcome.report.updated.len().to_string().cyan()
            );
        } else {
            println!("  Documents updated:  {}", updated.to_string().cyan());
        }
        println!("  Failures:           {}", failed.to_string().cyan());
        println!("  Time elapsed:       {:.2?}", elapsed);
        if !dry_run {
            println!();
            println!(
                "{} {}",
                "Ledger written to".green(),
                ledger_path.display().to_string().cyan()
            );
        }
    }

    Ok(())
}

fn cmd_report(
    path: &Path,
    ledger: Option<&Path>,
    exclude: &[String],
    json: bool,
    config: &Config,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    if !quiet && !json {
        println!("{} {}", "Resolving".cyan().bold(), path.display());
    }

    let outcome = run_crosswalk(path, exclude, config)?;
    let rows = sorted_ledger(&outcome.report.ledger);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let ledger_path = resolve_ledger_path(&outcome.corpus.root, ledger, config);
    write_ledger(&ledger_path, &outcome.report.ledger)?;

    if !quiet {
        println!();
        println!("{}", "Link Report".green().bold());
        println!("  Documents scanned:  {}", outcome.scanned.to_string().cyan());
        println!("  Links recorded:     {}", rows.len().to_string().cyan());
        println!(
            "  Missing backlinks:  {}",
            outcome.report.updated.len().to_string().cyan()
        );
        println!(
            "  Failures:           {}",
            outcome.load_failures.to_string().cyan()
        );
        println!("  Time elapsed:       {:.2?}", start.elapsed());
        println!();
        println!(
            "{} {}",
            "Ledger written to".green(),
            ledger_path.display().to_string().cyan()
        );
    }

    Ok(())
}

fn cmd_graph(
    csv: &Path,
    output: Option<&Path>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let links = read_ledger_originals(csv)?;
    log::info!("rendering {} links from {}", links.len(), csv.display());
    let chart = render_mermaid(&links);

    match output {
        Some(md_path) => {
            add_chart_to_markdown(md_path, &chart)?;
            if !quiet {
                println!(
                    "{} {}",
                    "Link chart written to".green(),
                    md_path.display().to_string().cyan()
                );
            }
        }
        None => println!("{}", chart),
    }

    Ok(())
}

// Pipeline

fn run_crosswalk(
    path: &Path,
    exclude: &[String],
    config: &Config,
) -> Result<PipelineOutcome, Box<dyn std::error::Error>> {
    let root = fs::canonicalize(path)
        .map_err(|e| format!("cannot resolve scan root {}: {}", path.display(), e))?;
    if !root.is_dir() {
        return Err(format!("scan root {} is not a directory", root.display()).into());
    }

    let mut patterns = config.scan.exclude.clone();
    patterns.extend(exclude.iter().cloned());
    let excludes = build_exclude_set(&patterns)?;

    let files = collect_markdown_files(&root, &excludes);
    log::info!("found {} markdown files under {}", files.len(), root.display());

    let scanned = files.len();
    let (mut corpus, load_failures) = build_corpus(&root, &files);
    let report = crosswalk(&mut corpus);

    Ok(PipelineOutcome {
        corpus,
        report,
        scanned,
        load_failures,
    })
}

fn build_exclude_set(patterns: &[String]) -> Result<GlobSet, Box<dyn std::error::Error>> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn collect_markdown_files(root: &Path, excludes: &GlobSet) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(true).git_ignore(true).git_global(true);

    let mut files = Vec::new();
    for entry in builder.build().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if ext != "md" {
            continue;
        }

        let rel = path.strip_prefix(root).unwrap_or(path);
        if !excludes.is_empty() && excludes.is_match(rel) {
            log::debug!("excluded {}", rel.display());
            continue;
        }

        files.push(path.to_path_buf());
    }

    // Stable ordering keeps ledger and backlink insertion deterministic across runs
    files.sort();
    files
}

fn build_corpus(root: &Path, files: &[PathBuf]) -> (Corpus, usize) {
    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut docs = BTreeMap::new();
    let mut failed = 0;

    for file in files {
        match load_document(file, root, &root_name) {
            Ok(doc) => {
                docs.insert(doc.rel_path.clone(), doc);
            }
            Err(e) => {
                log::error!("failed to load {}: {}", file.display(), e);
                failed += 1;
            }
        }
    }

    log::info!("loaded {} of {} markdown files", docs.len(), files.len());

    (
        Corpus {
            root: root.to_path_buf(),
            docs,
        },
        failed,
    )
}

fn load_document(
    path: &Path,
    root: &Path,
    root_name: &str,
) -> Result<Document, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let meta = parse_metadata(&content);
    let (body, section) = split_backlinks_section(&content);

    let doc_dir = path.parent().unwrap_or(root);
    let links: Vec<ResolvedLink> = find_links(&body, false)
        .into_iter()
        .map(|link| {
            let resolution = resolve_target(&link.target, doc_dir, root, root_name);
            match &resolution {
                Resolution::Broken(missed) => {
                    log::error!(
                        "broken link: {} -> {} (resolved to {})",
                        path.display(),
                        link.target,
                        missed
                    );
                }
                Resolution::OutsideRoot(resolved) => {
                    log::warn!(
                        "link outside scan path: {} -> {}",
                        path.display(),
                        resolved
                    );
                }
                _ => {}
            }
            ResolvedLink {
                text: link.text,
                target: link.target,
                resolution,
            }
        })
        .collect();

    let backlinks = section
        .as_deref()
        .map(|s| find_links(s, false))
        .unwrap_or_default();
    let backlink_targets = backlinks.iter().map(|l| l.target.clone()).collect();

    let rel_path = canonical_rel_path(path, root, root_name);
    let title = meta
        .get("TITLE")
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| rel_path.clone())
        });

    log::debug!(
        "loaded {} (title: {}, tags: {:?}, {} links, {} declared backlinks)",
        rel_path,
        title,
        meta.tags,
        links.len(),
        backlinks.len()
    );

    Ok(Document {
        path: path.to_path_buf(),
        rel_path,
        title,
        meta,
        content,
        links,
        backlinks,
        backlink_targets,
        added: Vec::new(),
        level: hierarchy_level(path, root),
        needs_update: false,
    })
}

// Crosswalker

/// All-pairs crosswalk over the corpus. Pass one is read-only: it records every
/// matched pair in the ledger and queues the missing reverse references. Pass two
/// applies the queue, touching each target document exactly once.
fn crosswalk(corpus: &mut Corpus) -> CrosswalkReport {
    let keys: Vec<String> = corpus.docs.keys().cloned().collect();
    let mut ledger = Vec::new();
    let mut pending: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut consumed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (i, akey) in keys.iter().enumerate() {
        for bkey in keys.iter().skip(i + 1) {
            let a = match corpus.docs.get(akey) {
                Some(doc) => doc,
                None => continue,
            };
            let b = match corpus.docs.get(bkey) {
                Some(doc) => doc,
                None => continue,
            };

            if links_to(a, bkey) {
                log::debug!("{} links to {}", akey, bkey);
                record_pair(&mut ledger, &mut pending, &mut consumed, a, b);
            }
            if links_to(b, akey) {
                log::debug!("{} links to {}", bkey, akey);
                record_pair(&mut ledger, &mut pending, &mut consumed, b, a);
            }
        }
    }

    // Everything that never matched another document: URLs stay valid leaf
    // records, markdown targets become broken or outside-root records, the
    // rest is dropped.
    for key in &keys {
        if let Some(doc) = corpus.docs.get(key) {
            residual_entries(doc, consumed.get(key), &mut ledger);
        }
    }

    let mut updated = Vec::new();
    for (key, additions) in pending {
        if let Some(doc) = corpus.docs.get_mut(&key) {
            for entry in additions {
                doc.added.push(entry);
            }
            doc.needs_update = true;
            updated.push(key);
        }
    }

    CrosswalkReport { ledger, updated }
}

fn links_to(doc: &Document, target_key: &str) -> bool {
    doc.links
        .iter()
        .any(|l| matches!(&l.resolution, Resolution::Internal(t) if t == target_key))
}

fn forward_link_text(doc: &Document, target_key: &str) -> String {
    doc.links
        .iter()
        .find(|l| matches!(&l.resolution, Resolution::Internal(t) if t == target_key))
        .map(|l| l.text.clone())
        .unwrap_or_default()
}

fn accepts_backlinks(doc: &Document) -> bool {
    doc.meta
        .get("BACKLINK")
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true)
}

fn record_pair(
    ledger: &mut Vec<LedgerEntry>,
    pending: &mut BTreeMap<String, Vec<(String, String)>>,
    consumed: &mut BTreeMap<String, BTreeSet<String>>,
    source: &Document,
    target: &Document,
) {
    consumed
        .entry(source.rel_path.clone())
        .or_default()
        .insert(target.rel_path.clone());

    ledger.push(LedgerEntry {
        source_file: source.rel_path.clone(),
        source_title: source.title.clone(),
        target_file: target.rel_path.clone(),
        target_title: target.title.clone(),
        link_text: forward_link_text(source, &target.rel_path),
        status: LinkStatus::Valid,
        hierarchy_level: source.level,
        link_type: LinkType::Original,
    });

    // Presence testing is by target path only; a stale display title on an
    // existing entry is left alone.
    if accepts_backlinks(target) && !target.backlink_targets.contains(&source.rel_path) {
        log::debug!(
            "{} is missing a backlink to {}",
            target.rel_path,
            source.rel_path
        );
        pending
            .entry(target.rel_path.clone())
            .or_default()
            .push((source.title.clone(), source.rel_path.clone()));
    }

    ledger.push(LedgerEntry {
        source_file: target.rel_path.clone(),
        source_title: target.title.clone(),
        target_file: source.rel_path.clone(),
        target_title: source.title.clone(),
        link_text: String::new(),
        status: LinkStatus::Valid,
        hierarchy_level: target.level,
        link_type: LinkType::Backlink,
    });
}

fn residual_entries(
    doc: &Document,
    consumed: Option<&BTreeSet<String>>,
    ledger: &mut Vec<LedgerEntry>,
) {
    for link in &doc.links {
        match &link.resolution {
            Resolution::Url => {
                ledger.push(LedgerEntry {
                    source_file: doc.rel_path.clone(),
                    source_title: doc.title.clone(),
                    target_file: link.target.clone(),
                    target_title: link.target.clone(),
                    link_text: link.text.clone(),
                    status: LinkStatus::Valid,
                    hierarchy_level: doc.level,
                    link_type: LinkType::Original,
                });
            }
            Resolution::Internal(target) => {
                if consumed.map_or(false, |set| set.contains(target)) {
                    continue;
                }
                // Resolves inside the root but matches no scanned document
                if target.to_ascii_lowercase().ends_with(".md") {
                    ledger.push(LedgerEntry {
                        source_file: doc.rel_path.clone(),
                        source_title: doc.title.clone(),
                        target_file: target.clone(),
                        target_title: target.clone(),
                        link_text: link.text.clone(),
                        status: LinkStatus::Broken,
                        hierarchy_level: doc.level,
                        link_type: LinkType::Original,
                    });
                }
            }
            Resolution::Broken(_) => {
                if link.target.to_ascii_lowercase().ends_with(".md") {
                    ledger.push(LedgerEntry {
                        source_file: doc.rel_path.clone(),
                        source_title: doc.title.clone(),
                        target_file: link.target.clone(),
                        target_title: link.target.clone(),
                        link_text: link.text.clone(),
                        status: LinkStatus::Broken,
                        hierarchy_level: doc.level,
                        link_type: LinkType::Original,
                    });
                }
            }
            Resolution::OutsideRoot(resolved) => {
                if link.target.to_ascii_lowercase().ends_with(".md") {
                    ledger.push(LedgerEntry {
                        source_file: doc.rel_path.clone(),
                        source_title: doc.title.clone(),
                        target_file: resolved.clone(),
                        target_title: resolved.clone(),
                        link_text: link.text.clone(),
                        status: LinkStatus::OutsideRoot,
                        hierarchy_level: doc.level,
                        link_type: LinkType::Original,
                    });
                }
            }
        }
    }
}

// Markdown operators

fn find_links(content: &str, markdown_only: bool) -> Vec<MdLink> {
    let pattern = if markdown_only {
        MARKDOWN_LINK_FINDER
    } else {
        LINK_FINDER
    };
    let link_re = Regex::new(pattern).unwrap();

    link_re
        .captures_iter(content)
        .map(|caps| MdLink {
            text: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            target: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .collect()
}

/// Locate the backlinks section: the region after the last line that is exactly
/// `# Backlinks`, running to the next top-level heading or end of document.
/// Returns (heading_start, section_start, section_end) byte offsets.
fn backlinks_region(content: &str) -> Option<(usize, usize, usize)> {
    let mut heading_start = None;
    let mut pos = 0;
    while pos <= content.len() {
        let end = content[pos..]
            .find('\n')
            .map(|i| pos + i)
            .unwrap_or(content.len());
        let line = content[pos..end].trim_end_matches('\r');
        if line == BACKLINKS_HEADING {
            heading_start = Some(pos);
        }
        if end == content.len() {
            break;
        }
        pos = end + 1;
    }

    let heading = heading_start?;
    let section_start = content[heading..]
        .find('\n')
        .map(|i| heading + i + 1)
        .unwrap_or(content.len());

    let section_end = if content[section_start..].starts_with("# ") {
        section_start
    } else {
        content[section_start..]
            .find("\n# ")
            .map(|i| section_start + i + 1)
            .unwrap_or(content.len())
    };

    Some((heading, section_start, section_end))
}

/// Split content into main body and the backlinks section, if one exists.
fn split_backlinks_section(content: &str) -> (String, Option<String>) {
    match backlinks_region(content) {
        Some((heading, section_start, section_end)) => {
            let mut body = String::from(&content[..heading]);
            body.push_str(&content[section_end..]);
            (body, Some(content[section_start..section_end].to_string()))
        }
        None => (content.to_string(), None),
    }
}

fn parse_metadata(content: &str) -> Metadata {
    let mut meta = Metadata::default();
    for field in META_FIELDS {
        meta.fields.insert(field.to_string(), None);
    }

    let header_re = Regex::new(META_HEADER_FINDER).unwrap();
    let header = match header_re.captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => {
            log::debug!("no metadata header found");
            return meta;
        }
    };

    for line in header.lines() {
        let (key, value) = match line.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        let key = key.trim().to_uppercase();
        let value = value.trim().to_string();
        if key == "TAGS" {
            meta.tags = split_tags(&value);
        }
        meta.fields.insert(key, Some(value));
    }

    meta
}

fn split_tags(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

// Path operators

/// Resolve a raw link target against the containing document's directory and
/// the scan root. Targets with a leading slash are root-relative when their
/// first segment names the root folder (case-insensitive).
fn resolve_target(target: &str, doc_dir: &Path, root: &Path, root_name: &str) -> Resolution {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Resolution::Url;
    }

    let candidate = match target.strip_prefix('/') {
        Some(stripped) => {
            let mut segments = stripped.split('/');
            match segments.next() {
                Some(first) if first.eq_ignore_ascii_case(root_name) => {
                    let rest: Vec<&str> = segments.collect();
                    if rest.is_empty() {
                        root.to_path_buf()
                    } else {
                        root.join(rest.join("/"))
                    }
                }
                _ => PathBuf::from(target),
            }
        }
        None => doc_dir.join(target),
    };

    match fs::canonicalize(&candidate) {
        Ok(resolved) => {
            if resolved.starts_with(root) {
                Resolution::Internal(canonical_rel_path(&resolved, root, root_name))
            } else {
                Resolution::OutsideRoot(slashify(&resolved))
            }
        }
        Err(_) => Resolution::Broken(slashify(&normalize_path(&candidate))),
    }
}

/// Canonical root-relative form: `/` + root folder name + `/` + relative path,
/// forward slashes regardless of host separator. Identical physical paths
/// canonicalize identically no matter which document referenced them.
fn canonical_rel_path(path: &Path, root: &Path, root_name: &str) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => {
            let joined = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            if joined.is_empty() {
                format!("/{}", root_name)
            } else {
                format!("/{}/{}", root_name, joined)
            }
        }
        Err(_) => slashify(path),
    }
}

fn slashify(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Fold `.` and `..` components without touching the filesystem; used to report
/// where a missing link target would have landed.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn hierarchy_level(path: &Path, root: &Path) -> i32 {
    match path.strip_prefix(root) {
        Ok(rel) => rel.components().count() as i32 - 1,
        Err(_) => -1,
    }
}

// Backlink section rewriter

fn render_backlinks_section(entries: &[(String, String)]) -> String {
    let mut out = String::from("\n# Backlinks\n\n");
    for (title, path) in entries {
        out.push_str(&format!("- [{}]({})\n", title, path));
    }
    out
}

/// Replace the trailing backlinks section with the resolved entry set. Entries
/// are de-duplicated by target path. Returns None when every entry is already
/// declared, so an untouched document is never rewritten. Bytes before the
/// section are carried over unchanged.
fn rewrite_backlinks(content: &str, entries: &[(String, String)]) -> Option<String> {
    let (region, existing_targets) = match backlinks_region(content) {
        Some((heading, section_start, section_end)) => {
            let targets: BTreeSet<String> = find_links(&content[section_start..section_end], false)
                .into_iter()
                .map(|l| l.target)
                .collect();
            (Some((heading, section_end)), targets)
        }
        None => (None, BTreeSet::new()),
    };

    let mut seen = BTreeSet::new();
    let mut deduped = Vec::new();
    for (title, path) in entries {
        if seen.insert(path.clone()) {
            deduped.push((title.clone(), path.clone()));
        }
    }

    if deduped.iter().all(|(_, path)| existing_targets.contains(path)) {
        return None;
    }

    let body = match region {
        Some((heading, section_end)) => {
            // Take the newline preceding the heading with the section, so
            // repeated rewrites do not accumulate blank lines
            let cut = if heading > 0 && content.as_bytes()[heading - 1] == b'\n' {
                heading - 1
            } else {
                heading
            };
            let mut body = String::from(&content[..cut]);
            body.push_str(&content[section_end..]);
            body
        }
        None => content.to_string(),
    };

    Some(body + &render_backlinks_section(&deduped))
}

fn persist_document(doc: &Document) -> Result<bool, Box<dyn std::error::Error>> {
    if !doc.needs_update {
        return Ok(false);
    }

    let mut entries: Vec<(String, String)> = doc
        .backlinks
        .iter()
        .map(|l| (l.text.clone(), l.target.clone()))
        .collect();
    entries.extend(doc.added.iter().cloned());

    match rewrite_backlinks(&doc.content, &entries) {
        Some(updated) => {
            fs::write(&doc.path, updated)?;
            log::debug!("wrote updated content to {}", doc.path.display());
            Ok(true)
        }
        None => Ok(false),
    }
}

// Ledger CSV

fn sorted_ledger(entries: &[LedgerEntry]) -> Vec<LedgerEntry> {
    let mut rows = entries.to_vec();
    rows.sort_by(|a, b| {
        (a.hierarchy_level, a.source_file.as_str()).cmp(&(b.hierarchy_level, b.source_file.as_str()))
    });
    rows
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_ledger(path: &Path, entries: &[LedgerEntry]) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("saving {} link records to {}", entries.len(), path.display());

    let mut out = String::new();
    out.push_str(&LEDGER_COLUMNS.join(","));
    out.push('\n');

    for entry in sorted_ledger(entries) {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            csv_field(&entry.source_file),
            csv_field(&entry.source_title),
            csv_field(&entry.target_file),
            csv_field(&entry.target_title),
            csv_field(&entry.link_text),
            entry.status.as_str(),
            entry.hierarchy_level,
            entry.link_type.as_str(),
        ));
    }

    fs::write(path, out)
        .map_err(|e| format!("cannot write ledger {}: {}", path.display(), e))?;
    log::debug!("ledger saved successfully");
    Ok(())
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn read_ledger_originals(path: &Path) -> Result<Vec<GraphLink>, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read ledger {}: {}", path.display(), e))?;

    let mut lines = text.lines();
    let header = lines.next().ok_or("ledger file is empty")?;
    let columns = parse_csv_line(header);
    let index_of = |name: &str| -> Result<usize, String> {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| format!("ledger is missing column {}", name))
    };

    let source_idx = index_of("source_file")?;
    let target_idx = index_of("target_file")?;
    let status_idx = index_of("status")?;
    let type_idx = index_of("link_type")?;

    let mut links = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields = parse_csv_line(line);
        if fields.len() < columns.len() {
            log::warn!("skipping short ledger row: {}", line);
            continue;
        }
        if fields[type_idx] != "original" {
            continue;
        }
        links.push(GraphLink {
            source: fields[source_idx].clone(),
            target: fields[target_idx].clone(),
            status: fields[status_idx].clone(),
        });
    }

    Ok(links)
}

// Mermaid graph

fn sanitize_node_name(file_path: &str) -> String {
    let stem = Path::new(file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string());
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn node_display(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string())
}

/// Render a Mermaid flowchart: one node per distinct document, one edge per
/// link, styled by status (solid valid, dashed broken, double outside-root).
fn render_mermaid(links: &[GraphLink]) -> String {
    let mut lines = vec!["```mermaid".to_string(), "flowchart TD".to_string()];

    let mut nodes: HashSet<String> = HashSet::new();
    for link in links {
        for file in [&link.source, &link.target] {
            let node = sanitize_node_name(file);
            if nodes.insert(node.clone()) {
                lines.push(format!("    {}[\"{}\"]", node, node_display(file)));
            }
        }
    }

    for link in links {
        let source = sanitize_node_name(&link.source);
        let target = sanitize_node_name(&link.target);
        let arrow = match link.status.as_str() {
            "valid" => "-->",
            "broken" => "-.->",
            _ => "==>",
        };
        lines.push(format!("    {} {} {}", source, arrow, target));
    }

    lines.push("```".to_string());
    lines.join("\n")
}

fn add_chart_to_markdown(
    md_path: &Path,
    chart: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = if md_path.exists() {
        fs::read_to_string(md_path)?
    } else {
        String::new()
    };

    let chart_re = Regex::new(r"(?s)\n*## Link Chart\n\n```mermaid\n.*?\n```\n*")?;
    let stripped = chart_re.replace_all(&content, "");

    let updated = format!("{}\n\n## Link Chart\n\n{}\n", stripped, chart);
    fs::write(md_path, updated)?;
    Ok(())
}

// Setup

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read config {}: {}", path.display(), e))?;
    let config: Config =
        toml::from_str(&text).map_err(|e| format!("invalid config {}: {}", path.display(), e))?;
    log::debug!("loaded config from {}", path.display());
    Ok(config)
}

fn resolve_ledger_path(root: &Path, cli_ledger: Option<&Path>, config: &Config) -> PathBuf {
    if let Some(path) = cli_ledger {
        return path.to_path_buf();
    }
    match &config.scan.ledger {
        Some(name) => {
            let path = PathBuf::from(name);
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        }
        None => root.join("backlinks.csv"),
    }
}

fn setup_logging(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(level) = cli.log_level {
        builder.filter_level(match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        });
    }
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    }

    match &cli.log_file {
        Some(path) => {
            let file = fs::File::create(path)
                .map_err(|e| format!("cannot open log file {}: {}", path.display(), e))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }

    builder.init();
    Ok(())
}
