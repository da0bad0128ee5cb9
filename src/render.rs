//! Document body → render tree.
//!
//! ```text
//! body ── cut marker split ── token links ── pulldown-cmark events
//!                                               ↓ frame stack
//!                                         RenderNode tree
//!                                               ↓ paragraph pass
//!                          galleries, embedded documents, blob images
//! ```
//!
//! Images pointing at `/blob/<id>` are resolved through one path whether
//! the blob is still pending in a draft or already committed: memoized URL,
//! then pending bytes (inlined as a `data:` URL), then the committed
//! locator via [`BlobResolver::url_for`]. Anything else renders as a
//! placeholder and is queued for [`RenderEngine::resolve_pending`]. Unknown
//! embedded documents are queued the same way.
//!
//! Rendered documents are memoized per (id, version, options, generation);
//! every successful resolution bumps the generation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};
use regex::Regex;
use serde::Serialize;

use crate::config::RenderConfig;
use crate::content_id::ContentId;
use crate::draft::{Draft, DraftTarget};
use crate::history;
use crate::image_fit;
use crate::models::{BlobLocator, Document, DocumentId, Extension};
use crate::service::{BlobResolver, DocumentService};
use crate::tokens::{self, TokenKind};

/// Separates the always-visible head of a post from its collapsible tail.
pub const CUT_MARKER: &str = "\n\n\n\n";

fn post_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:#)?/post/([A-Za-z0-9_-]+)/?$").expect("post link regex is valid")
    })
}

fn size_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)x(\d+)").expect("size hint regex is valid"))
}

// ═══════════════════════════════════════════════════════════════════════
// Render tree
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageNode {
    /// `None` while the blob is still being resolved.
    pub src: Option<String>,
    pub alt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blob: Option<ContentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Loading,
    NotFound,
    DepthLimit,
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderNode {
    Text { text: String },
    Code { text: String },
    CodeBlock { lang: Option<String>, text: String },
    Paragraph { children: Vec<RenderNode> },
    Heading { level: u8, children: Vec<RenderNode> },
    BlockQuote { children: Vec<RenderNode> },
    List { start: Option<u64>, children: Vec<RenderNode> },
    Item { children: Vec<RenderNode> },
    Emphasis { children: Vec<RenderNode> },
    Strong { children: Vec<RenderNode> },
    Strikethrough { children: Vec<RenderNode> },
    Link { href: String, children: Vec<RenderNode> },
    Image(ImageNode),
    Gallery { images: Vec<ImageNode>, current: usize },
    Embedded(Box<RenderedDocument>),
    Unavailable { id: DocumentId, reason: UnavailableReason },
    Poll { options: Vec<String>, deadline_hours: u64 },
    Proposal { id: u64 },
    Feature,
    SoftBreak,
    HardBreak,
    Rule,
}

impl RenderNode {
    fn text(text: impl Into<String>) -> Self {
        RenderNode::Text { text: text.into() }
    }

    fn is_blank(&self) -> bool {
        match self {
            RenderNode::Text { text } => text.trim().is_empty(),
            RenderNode::SoftBreak | RenderNode::HardBreak => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedDocument {
    pub id: Option<DocumentId>,
    pub version: usize,
    pub nodes: Vec<RenderNode>,
    /// Text after the cut marker, present only in summary context.
    pub collapsed: Option<Vec<RenderNode>>,
    /// Rendering of the document's extension.
    pub attachment: Option<RenderNode>,
    /// `false` when the requested version could not be rebuilt exactly.
    pub clean: bool,
    /// `true` while placeholders are waiting on [`RenderEngine::resolve_pending`].
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Feed context: collapse the tail after the cut marker.
    pub summary: bool,
    /// Embed documents linked from a paragraph of their own.
    pub transclude: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            summary: false,
            transclude: true,
        }
    }
}

/// Blobs an image reference may resolve against.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaView<'a> {
    pub pending: Option<&'a BTreeMap<ContentId, Vec<u8>>>,
    pub stored: Option<&'a BTreeMap<ContentId, BlobLocator>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════

type CacheKey = (DocumentId, usize, bool, bool, u64);

pub struct RenderEngine {
    config: RenderConfig,
    resolver: Arc<dyn BlobResolver>,
    urls: HashMap<ContentId, String>,
    documents: HashMap<DocumentId, Document>,
    missing_documents: HashSet<DocumentId>,
    pending_blobs: BTreeMap<ContentId, BlobLocator>,
    pending_documents: BTreeSet<DocumentId>,
    cache: HashMap<CacheKey, RenderedDocument>,
    generation: u64,
}

/// State threaded through one document's render.
struct Pass<'a> {
    media: MediaView<'a>,
    opts: RenderOptions,
    depth: usize,
    visited: Vec<DocumentId>,
    pending: bool,
}

enum FrameKind {
    Root,
    Transparent,
    Paragraph,
    Heading(u8),
    BlockQuote,
    CodeBlock(Option<String>),
    List(Option<u64>),
    Item,
    Emphasis,
    Strong,
    Strikethrough,
    Link(String),
    Image(String),
}

struct Frame {
    kind: FrameKind,
    children: Vec<RenderNode>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    fn open(tag: Tag<'_>) -> Self {
        let kind = match tag {
            Tag::Paragraph => FrameKind::Paragraph,
            Tag::Heading { level, .. } => FrameKind::Heading(heading_level_to_u8(level)),
            Tag::BlockQuote(_) => FrameKind::BlockQuote,
            Tag::CodeBlock(CodeBlockKind::Fenced(lang)) if !lang.is_empty() => {
                FrameKind::CodeBlock(Some(lang.to_string()))
            }
            Tag::CodeBlock(_) => FrameKind::CodeBlock(None),
            Tag::List(start) => FrameKind::List(start),
            Tag::Item => FrameKind::Item,
            Tag::Emphasis => FrameKind::Emphasis,
            Tag::Strong => FrameKind::Strong,
            Tag::Strikethrough => FrameKind::Strikethrough,
            Tag::Link { dest_url, .. } => FrameKind::Link(dest_url.to_string()),
            Tag::Image { dest_url, .. } => FrameKind::Image(dest_url.to_string()),
            _ => FrameKind::Transparent,
        };
        Self::new(kind)
    }

    /// Append a node, merging adjacent text runs.
    fn push(&mut self, node: RenderNode) {
        if let RenderNode::Text { text } = &node {
            if let Some(RenderNode::Text { text: last }) = self.children.last_mut() {
                last.push_str(text);
                return;
            }
        }
        self.children.push(node);
    }
}

impl RenderEngine {
    pub fn new(config: RenderConfig, resolver: Arc<dyn BlobResolver>) -> Self {
        Self {
            config,
            resolver,
            urls: HashMap::new(),
            documents: HashMap::new(),
            missing_documents: HashSet::new(),
            pending_blobs: BTreeMap::new(),
            pending_documents: BTreeSet::new(),
            cache: HashMap::new(),
            generation: 0,
        }
    }

    /// Make a document available for embedding.
    pub fn insert_document(&mut self, doc: Document) {
        self.missing_documents.remove(&doc.id);
        self.documents.insert(doc.id.clone(), doc);
        self.bump_generation();
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queued blob and document resolutions.
    pub fn pending_count(&self) -> usize {
        self.pending_blobs.len() + self.pending_documents.len()
    }

    /// Memoized URL of a blob, once known.
    pub fn blob_url(&self, id: &ContentId) -> Option<&str> {
        self.urls.get(id).map(String::as_str)
    }

    /// Render `doc` as it was at `version` (clamped to the latest).
    pub fn render_document(
        &mut self,
        doc: &Document,
        version: usize,
        opts: RenderOptions,
    ) -> RenderedDocument {
        let version = version.min(doc.latest_version());
        let key = (
            doc.id.clone(),
            version,
            opts.summary,
            opts.transclude,
            self.generation,
        );
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let rebuilt = history::reconstruct(doc, version);
        let mut pass = Pass {
            media: MediaView {
                pending: None,
                stored: Some(&doc.media_map),
            },
            opts,
            depth: 0,
            visited: vec![doc.id.clone()],
            pending: false,
        };
        let rendered = self.render_body(
            Some(doc.id.clone()),
            version,
            &rebuilt.body,
            &doc.extension,
            rebuilt.clean,
            &mut pass,
        );
        self.cache.insert(key, rendered.clone());
        rendered
    }

    /// Preview a draft, inlining its pending blobs.
    pub fn render_draft(&mut self, draft: &Draft, opts: RenderOptions) -> RenderedDocument {
        let (stored, visited) = match draft.target() {
            DraftTarget::Edit {
                id, existing_media, ..
            } => (Some(existing_media), vec![id.clone()]),
            _ => (None, Vec::new()),
        };
        let mut pass = Pass {
            media: MediaView {
                pending: Some(draft.pending_blobs()),
                stored,
            },
            opts,
            depth: 0,
            visited,
            pending: false,
        };
        self.render_body(None, 0, draft.text(), &draft.extension, true, &mut pass)
    }

    /// Fetch every queued blob and document. Returns how many were settled.
    pub async fn resolve_pending(&mut self, service: &dyn DocumentService) -> Result<usize> {
        let blobs: Vec<(ContentId, BlobLocator)> =
            std::mem::take(&mut self.pending_blobs).into_iter().collect();
        let ids: Vec<DocumentId> = std::mem::take(&mut self.pending_documents)
            .into_iter()
            .collect();
        let mut settled = 0;

        let resolver = self.resolver.clone();
        let fetches = blobs.iter().map(|(id, locator)| {
            let resolver = &resolver;
            async move { (id, resolver.resolve_blob(locator).await) }
        });
        for (id, result) in join_all(fetches).await {
            match result {
                Ok(bytes) => {
                    self.urls.insert(id.clone(), data_url(&bytes));
                    settled += 1;
                }
                Err(e) => tracing::warn!(blob = %id, error = %e, "failed to resolve blob"),
            }
        }

        if !ids.is_empty() {
            let docs = match service.fetch_documents(&ids).await {
                Ok(docs) => docs,
                Err(e) => {
                    self.pending_documents.extend(ids);
                    if settled > 0 {
                        self.bump_generation();
                    }
                    return Err(e);
                }
            };
            let mut found = HashSet::new();
            for doc in docs {
                found.insert(doc.id.clone());
                self.documents.insert(doc.id.clone(), doc);
            }
            for id in ids {
                if !found.contains(&id) {
                    tracing::debug!(document = %id, "embedded document not found");
                    self.missing_documents.insert(id);
                }
                settled += 1;
            }
        }

        if settled > 0 {
            self.bump_generation();
        }
        Ok(settled)
    }

    /// Render, resolve what is missing, and re-render until nothing is pending.
    pub async fn render_resolved(
        &mut self,
        doc: &Document,
        version: usize,
        opts: RenderOptions,
        service: &dyn DocumentService,
    ) -> Result<RenderedDocument> {
        let mut rendered = self.render_document(doc, version, opts);
        for _ in 0..self.config.max_resolve_passes {
            if !rendered.pending || self.resolve_pending(service).await? == 0 {
                break;
            }
            rendered = self.render_document(doc, version, opts);
        }
        Ok(rendered)
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
        self.cache.clear();
    }

    fn render_body(
        &mut self,
        id: Option<DocumentId>,
        version: usize,
        body: &str,
        extension: &Extension,
        clean: bool,
        pass: &mut Pass<'_>,
    ) -> RenderedDocument {
        let (head, tail) = match body.split_once(CUT_MARKER) {
            Some((head, tail)) if pass.opts.summary => (head, Some(tail)),
            _ => (body, None),
        };
        let nodes = self.render_markdown(head, pass);
        let collapsed = tail.map(|tail| self.render_markdown(tail, pass));
        let attachment = self.render_extension(extension, pass);
        RenderedDocument {
            id,
            version,
            nodes,
            collapsed,
            attachment,
            clean,
            pending: pass.pending,
        }
    }

    fn render_extension(&mut self, extension: &Extension, pass: &mut Pass<'_>) -> Option<RenderNode> {
        match extension {
            Extension::None => None,
            Extension::Poll(poll) => Some(RenderNode::Poll {
                options: poll.options.clone(),
                deadline_hours: poll.deadline_hours,
            }),
            Extension::Repost(id) => Some(self.embed(id, pass)),
            Extension::Proposal(id) => Some(RenderNode::Proposal { id: *id }),
            Extension::Feature => Some(RenderNode::Feature),
        }
    }

    fn render_markdown(&mut self, text: &str, pass: &mut Pass<'_>) -> Vec<RenderNode> {
        let config = &self.config;
        let linked = tokens::rewrite_links(text, |kind, name| token_target(config, kind, name));

        let mut stack = vec![Frame::new(FrameKind::Root)];
        for event in Parser::new_ext(&linked, Options::ENABLE_STRIKETHROUGH) {
            let node = match event {
                Event::Start(tag) => {
                    stack.push(Frame::open(tag));
                    continue;
                }
                Event::End(_) => {
                    if stack.len() > 1 {
                        if let Some(frame) = stack.pop() {
                            let nodes = self.close_frame(frame, pass);
                            if let Some(parent) = stack.last_mut() {
                                nodes.into_iter().for_each(|n| parent.push(n));
                            }
                        }
                    }
                    continue;
                }
                Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => {
                    RenderNode::text(text.into_string())
                }
                Event::Code(text) => RenderNode::Code {
                    text: text.into_string(),
                },
                Event::SoftBreak => RenderNode::SoftBreak,
                Event::HardBreak => RenderNode::HardBreak,
                Event::Rule => RenderNode::Rule,
                Event::TaskListMarker(done) => RenderNode::text(if done { "[x] " } else { "[ ] " }),
                Event::FootnoteReference(label) => RenderNode::text(format!("[^{}]", label)),
                _ => continue,
            };
            if let Some(frame) = stack.last_mut() {
                frame.push(node);
            }
        }

        while stack.len() > 1 {
            if let Some(frame) = stack.pop() {
                let nodes = self.close_frame(frame, pass);
                if let Some(parent) = stack.last_mut() {
                    nodes.into_iter().for_each(|n| parent.push(n));
                }
            }
        }
        stack.pop().map(|root| root.children).unwrap_or_default()
    }

    fn close_frame(&mut self, frame: Frame, pass: &mut Pass<'_>) -> Vec<RenderNode> {
        let children = frame.children;
        let node = match frame.kind {
            FrameKind::Root | FrameKind::Transparent => return children,
            FrameKind::Paragraph => self.finish_paragraph(children, pass),
            FrameKind::Heading(level) => RenderNode::Heading { level, children },
            FrameKind::BlockQuote => RenderNode::BlockQuote { children },
            FrameKind::CodeBlock(lang) => RenderNode::CodeBlock {
                lang,
                text: plain_text(&children),
            },
            FrameKind::List(start) => RenderNode::List { start, children },
            FrameKind::Item => RenderNode::Item { children },
            FrameKind::Emphasis => RenderNode::Emphasis { children },
            FrameKind::Strong => RenderNode::Strong { children },
            FrameKind::Strikethrough => RenderNode::Strikethrough { children },
            FrameKind::Link(href) => RenderNode::Link { href, children },
            FrameKind::Image(dest) => RenderNode::Image(self.image(dest, plain_text(&children), pass)),
        };
        vec![node]
    }

    fn finish_paragraph(&mut self, children: Vec<RenderNode>, pass: &mut Pass<'_>) -> RenderNode {
        if pass.opts.transclude {
            // A link to a post the service does not know stays a link.
            match transclusion_target(&self.config, &children) {
                Some(id) if !self.missing_documents.contains(&id) => {
                    return self.embed(&id, pass);
                }
                _ => {}
            }
        }
        RenderNode::Paragraph {
            children: group_images(children),
        }
    }

    fn embed(&mut self, id: &DocumentId, pass: &mut Pass<'_>) -> RenderNode {
        let unavailable = |reason| RenderNode::Unavailable {
            id: id.clone(),
            reason,
        };
        if pass.visited.contains(id) {
            return unavailable(UnavailableReason::Cycle);
        }
        if pass.depth >= self.config.max_transclusion_depth {
            return unavailable(UnavailableReason::DepthLimit);
        }
        if self.missing_documents.contains(id) {
            return unavailable(UnavailableReason::NotFound);
        }
        let Some(doc) = self.documents.get(id).cloned() else {
            self.pending_documents.insert(id.clone());
            pass.pending = true;
            return unavailable(UnavailableReason::Loading);
        };

        let mut visited = pass.visited.clone();
        visited.push(doc.id.clone());
        let mut nested = Pass {
            media: MediaView {
                pending: None,
                stored: Some(&doc.media_map),
            },
            opts: RenderOptions {
                summary: true,
                ..pass.opts
            },
            depth: pass.depth + 1,
            visited,
            pending: false,
        };
        let rendered = self.render_body(
            Some(doc.id.clone()),
            doc.latest_version(),
            &doc.body,
            &doc.extension,
            true,
            &mut nested,
        );
        pass.pending |= nested.pending;
        RenderNode::Embedded(Box::new(rendered))
    }

    fn image(&mut self, dest: String, alt: String, pass: &mut Pass<'_>) -> ImageNode {
        let (width, height) = size_hint(&alt);
        let blob = tokens::blob_target(&dest).and_then(|raw| raw.parse::<ContentId>().ok());
        let src = match &blob {
            Some(id) => self.resolve_blob_url(id, pass),
            None => Some(dest),
        };
        ImageNode {
            src,
            alt,
            width,
            height,
            blob,
        }
    }

    fn resolve_blob_url(&mut self, id: &ContentId, pass: &mut Pass<'_>) -> Option<String> {
        if let Some(url) = self.urls.get(id) {
            return Some(url.clone());
        }
        if let Some(bytes) = pass.media.pending.and_then(|pending| pending.get(id)) {
            let url = data_url(bytes);
            self.urls.insert(id.clone(), url.clone());
            return Some(url);
        }
        match pass.media.stored.and_then(|stored| stored.get(id)) {
            Some(locator) => {
                if let Some(url) = self.resolver.url_for(locator) {
                    self.urls.insert(id.clone(), url.clone());
                    return Some(url);
                }
                self.pending_blobs.insert(id.clone(), locator.clone());
                pass.pending = true;
            }
            None => tracing::debug!(blob = %id, "image references an unknown blob"),
        }
        None
    }
}

fn token_target(config: &RenderConfig, kind: TokenKind, name: &str) -> String {
    match kind {
        TokenKind::Hashtag => format!("{}{}", config.feed_prefix, name),
        TokenKind::Cashtag => format!("{}${}", config.feed_prefix, name),
        TokenKind::Mention => format!("{}{}", config.user_prefix, name),
    }
}

fn heading_level_to_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn data_url(bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        image_fit::mime_type(bytes),
        STANDARD.encode(bytes)
    )
}

/// `WxH` layout hint from the start of an image's alt text.
fn size_hint(alt: &str) -> (Option<u32>, Option<u32>) {
    size_hint_regex()
        .captures(alt)
        .map(|caps| (caps[1].parse().ok(), caps[2].parse().ok()))
        .unwrap_or((None, None))
}

fn plain_text(nodes: &[RenderNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            RenderNode::Text { text } | RenderNode::Code { text } => out.push_str(text),
            RenderNode::SoftBreak | RenderNode::HardBreak => out.push(' '),
            RenderNode::Paragraph { children }
            | RenderNode::Heading { children, .. }
            | RenderNode::BlockQuote { children }
            | RenderNode::List { children, .. }
            | RenderNode::Item { children }
            | RenderNode::Emphasis { children }
            | RenderNode::Strong { children }
            | RenderNode::Strikethrough { children }
            | RenderNode::Link { children, .. } => out.push_str(&plain_text(children)),
            _ => {}
        }
    }
    out
}

/// Id of an app-internal post link: `/post/<id>`, `#/post/<id>`, or either
/// shape under the configured app origin.
fn post_id(config: &RenderConfig, target: &str) -> Option<DocumentId> {
    let path = match config.app_origin.as_deref() {
        Some(origin) => target
            .strip_prefix(origin.trim_end_matches('/'))
            .unwrap_or(target),
        None => target,
    };
    let path = path.strip_prefix("/#").unwrap_or(path);
    post_link_regex()
        .captures(path)
        .map(|caps| DocumentId(caps[1].to_string()))
}

/// The document a paragraph consisting of a single post link points at.
fn transclusion_target(config: &RenderConfig, children: &[RenderNode]) -> Option<DocumentId> {
    let content: Vec<&RenderNode> = children.iter().filter(|n| !n.is_blank()).collect();
    match content.as_slice() {
        [RenderNode::Link { href, .. }] => post_id(config, href),
        [RenderNode::Text { text }] if !text.trim().contains(char::is_whitespace) => {
            post_id(config, text.trim())
        }
        _ => None,
    }
}

/// Group runs of two or more images in a paragraph into galleries.
fn group_images(children: Vec<RenderNode>) -> Vec<RenderNode> {
    let images = children
        .iter()
        .filter(|n| matches!(n, RenderNode::Image(_)))
        .count();
    if images < 2 {
        return children;
    }

    let mut out = Vec::with_capacity(children.len());
    let mut run: Vec<ImageNode> = Vec::new();
    let mut gap: Vec<RenderNode> = Vec::new();
    for node in children {
        match node {
            RenderNode::Image(image) => {
                gap.clear();
                run.push(image);
            }
            node if node.is_blank() && !run.is_empty() => gap.push(node),
            node => {
                flush_run(&mut out, &mut run);
                out.append(&mut gap);
                out.push(node);
            }
        }
    }
    flush_run(&mut out, &mut run);
    out.append(&mut gap);
    out
}

fn flush_run(out: &mut Vec<RenderNode>, run: &mut Vec<ImageNode>) {
    match run.len() {
        0 => {}
        1 => out.extend(run.drain(..).map(RenderNode::Image)),
        _ => out.push(RenderNode::Gallery {
            images: std::mem::take(run),
            current: 0,
        }),
    }
}
