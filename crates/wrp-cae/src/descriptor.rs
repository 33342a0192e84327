//! Job descriptors.
//!
//! Callers describe a job with free strings (`file::/data/a.bin`,
//! `ns::tag`, `binary`). They are parsed once, here, into closed variants;
//! anything unknown or malformed is rejected with `InvalidContext` before a
//! job exists.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use wrp_reduce::CodecSpec;
use wrp_storage::{PoolId, PoolQuery, Reassimilation, Tag};

use crate::error::{CaeError, CaeResult};
use crate::ingest::DatasetFilter;
use crate::job::JobId;

/// Data format of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Flat byte stream
    Binary,
    /// Byte range of a flat file
    Range,
    /// HDF5 dataset
    Hdf5,
}

impl FromStr for Format {
    type Err = CaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Format::Binary),
            "range" => Ok(Format::Range),
            "hdf5" => Ok(Format::Hdf5),
            other => Err(CaeError::invalid("format", format!("unknown format '{}'", other))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Binary => write!(f, "binary"),
            Format::Range => write!(f, "range"),
            Format::Hdf5 => write!(f, "hdf5"),
        }
    }
}

/// Parsed source URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// `file::<path>`
    File {
        /// File path
        path: PathBuf,
    },
    /// `range::<path>[<offset>:<size>]`
    Range {
        /// File path
        path: PathBuf,
        /// First byte
        offset: u64,
        /// Number of bytes
        size: u64,
    },
    /// `hdf5::<file>:<dataset>`, or `hdf5::<file>` to walk every dataset
    Hdf5 {
        /// HDF5 file path
        file: PathBuf,
        /// Dataset path inside the file; None walks the whole file
        dataset: Option<String>,
        /// Datasets a whole-file walk keeps. Not part of the URI.
        filter: DatasetFilter,
    },
    /// `iowarp::<namespace>::<name>`, an existing tag
    Tag(Tag),
}

impl Source {
    /// Parses a `<scheme>::<rest>` URI.
    pub fn parse(s: &str) -> CaeResult<Self> {
        let (scheme, rest) = s
            .split_once("::")
            .ok_or_else(|| CaeError::invalid("src", format!("'{}' has no scheme", s)))?;
        if rest.is_empty() {
            return Err(CaeError::invalid("src", format!("'{}' has an empty path", s)));
        }
        match scheme {
            "file" => Ok(Source::File {
                path: PathBuf::from(rest),
            }),
            "range" => parse_range(rest),
            "hdf5" => {
                let (file, dataset) = match rest.rsplit_once(':') {
                    Some((f, d)) if !f.is_empty() && !d.is_empty() => (f, Some(d.to_string())),
                    Some(_) => {
                        return Err(CaeError::invalid(
                            "src",
                            format!("'{}' is not hdf5::<file>[:<dataset>]", s),
                        ))
                    }
                    None => (rest, None),
                };
                Ok(Source::Hdf5 {
                    file: PathBuf::from(file),
                    dataset,
                    filter: DatasetFilter::default(),
                })
            }
            "iowarp" => Tag::parse(rest)
                .map(Source::Tag)
                .map_err(|e| CaeError::invalid("src", e.to_string())),
            other => Err(CaeError::invalid("src", format!("unknown scheme '{}'", other))),
        }
    }

    /// Scheme name.
    pub fn scheme(&self) -> &'static str {
        match self {
            Source::File { .. } => "file",
            Source::Range { .. } => "range",
            Source::Hdf5 { .. } => "hdf5",
            Source::Tag(_) => "iowarp",
        }
    }

    /// Formats this scheme can be read as.
    fn accepts(&self, format: Format) -> bool {
        matches!(
            (self, format),
            (Source::File { .. }, Format::Binary)
                | (Source::Tag(_), Format::Binary)
                | (Source::Range { .. }, Format::Range)
                | (Source::Hdf5 { .. }, Format::Hdf5)
        )
    }
}

fn parse_range(rest: &str) -> CaeResult<Source> {
    let bad = || CaeError::invalid("src", format!("'{}' is not <path>[<offset>:<size>]", rest));
    let body = rest.strip_suffix(']').ok_or_else(bad)?;
    let (path, spec) = body.rsplit_once('[').ok_or_else(bad)?;
    let (offset, size) = spec.split_once(':').ok_or_else(bad)?;
    let offset: u64 = offset.trim().parse().map_err(|_| bad())?;
    let size: u64 = size.trim().parse().map_err(|_| bad())?;
    if path.is_empty() {
        return Err(bad());
    }
    if size == 0 {
        return Err(CaeError::invalid("src", "range size must be non-zero"));
    }
    if offset.checked_add(size).is_none() {
        return Err(CaeError::invalid("src", "range end overflows"));
    }
    Ok(Source::Range {
        path: PathBuf::from(path),
        offset,
        size,
    })
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File { path } => write!(f, "file::{}", path.display()),
            Source::Range { path, offset, size } => {
                write!(f, "range::{}[{}:{}]", path.display(), offset, size)
            }
            Source::Hdf5 {
                file,
                dataset: Some(dataset),
                ..
            } => write!(f, "hdf5::{}:{}", file.display(), dataset),
            Source::Hdf5 { file, .. } => write!(f, "hdf5::{}", file.display()),
            Source::Tag(tag) => write!(f, "iowarp::{}", tag),
        }
    }
}

/// Validated assimilation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssimilationCtx {
    source: Source,
    destination: Tag,
    format: Format,
    compression_hint: Option<CodecSpec>,
    overwrite: Option<Reassimilation>,
    pool_query: PoolQuery,
    depends_on: Option<JobId>,
}

impl AssimilationCtx {
    /// Parses and validates the three required fields.
    pub fn new(src: &str, dst: &str, format: &str) -> CaeResult<Self> {
        let source = Source::parse(src)?;
        let destination = Tag::parse(dst).map_err(|e| CaeError::invalid("dst", e.to_string()))?;
        let format: Format = format.parse()?;

        if !source.accepts(format) {
            return Err(CaeError::invalid(
                "format",
                format!("{} sources cannot be read as {}", source.scheme(), format),
            ));
        }
        if let Source::Tag(tag) = &source {
            if *tag == destination {
                return Err(CaeError::invalid("dst", "source and destination tag are the same"));
            }
        }

        Ok(Self {
            source,
            destination,
            format,
            compression_hint: None,
            overwrite: None,
            pool_query: PoolQuery::Dynamic,
            depends_on: None,
        })
    }

    /// Forces a codec (`none`, `lz4`, `zstd`, `zstd:<level>`) and skips selection.
    pub fn with_compression_hint(mut self, hint: &str) -> CaeResult<Self> {
        let spec: CodecSpec = hint
            .parse()
            .map_err(|e: wrp_reduce::ReduceError| CaeError::invalid("compression_hint", e.to_string()))?;
        self.compression_hint = Some(spec);
        Ok(self)
    }

    /// Re-assimilation policy when the destination is already bound.
    pub fn with_overwrite(mut self, policy: Reassimilation) -> Self {
        self.overwrite = Some(policy);
        self
    }

    /// Pins the destination pool.
    pub fn with_pool(mut self, pool: PoolId) -> Self {
        self.pool_query = PoolQuery::Static(pool);
        self
    }

    /// Restricts a whole-file HDF5 walk to datasets matching `include` (all
    /// if empty) and not matching `exclude`.
    pub fn with_dataset_filter(
        mut self,
        include: &[impl AsRef<str>],
        exclude: &[impl AsRef<str>],
    ) -> CaeResult<Self> {
        let compiled = DatasetFilter::new(include, exclude)?;
        if compiled.is_empty() {
            return Ok(self);
        }
        match &mut self.source {
            Source::Hdf5 {
                dataset: None,
                filter,
                ..
            } => *filter = compiled,
            _ => {
                return Err(CaeError::invalid(
                    "include_patterns",
                    "dataset patterns need an hdf5::<file> source without a dataset",
                ))
            }
        }
        Ok(self)
    }

    /// Starts the job only after `job` has completed. If it fails, so does
    /// this one.
    pub fn with_dependency(mut self, job: JobId) -> Self {
        self.depends_on = Some(job);
        self
    }

    /// Parsed source.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Destination tag.
    pub fn destination(&self) -> &Tag {
        &self.destination
    }

    /// Source format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Explicit codec, if any.
    pub fn compression_hint(&self) -> Option<CodecSpec> {
        self.compression_hint
    }

    /// Explicit re-assimilation policy, if any.
    pub fn overwrite(&self) -> Option<Reassimilation> {
        self.overwrite
    }

    /// How the destination pool is resolved.
    pub fn pool_query(&self) -> PoolQuery {
        self.pool_query
    }

    /// Dataset filter of a whole-file HDF5 walk.
    pub fn dataset_filter(&self) -> Option<&DatasetFilter> {
        match &self.source {
            Source::Hdf5 { filter, .. } => Some(filter),
            _ => None,
        }
    }

    /// Job that must complete first.
    pub fn depends_on(&self) -> Option<JobId> {
        self.depends_on
    }
}

/// Wire form of a job, as received in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Source URI
    pub src: String,
    /// Destination tag
    pub dst: String,
    /// Format name
    pub format: String,
    /// Codec hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_hint: Option<String>,
    /// `reject`, `append` or `replace`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<String>,
    /// Static pool id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<u64>,
    /// Job that must complete first (`job-<n>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    /// Dataset globs a whole-file HDF5 walk keeps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,
    /// Dataset globs a whole-file HDF5 walk skips
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
}

impl JobDescriptor {
    /// Parses one descriptor from JSON.
    pub fn from_json(json: &str) -> CaeResult<Self> {
        serde_json::from_str(json).map_err(|e| CaeError::invalid("descriptor", e.to_string()))
    }

    /// Parses a JSON array of descriptors.
    pub fn list_from_json(json: &str) -> CaeResult<Vec<Self>> {
        serde_json::from_str(json).map_err(|e| CaeError::invalid("descriptor", e.to_string()))
    }
}

impl TryFrom<JobDescriptor> for AssimilationCtx {
    type Error = CaeError;

    fn try_from(d: JobDescriptor) -> Result<Self, Self::Error> {
        let mut ctx = AssimilationCtx::new(&d.src, &d.dst, &d.format)?;
        if let Some(hint) = d.compression_hint.as_deref() {
            ctx = ctx.with_compression_hint(hint)?;
        }
        if let Some(policy) = d.overwrite.as_deref() {
            let policy: Reassimilation = policy
                .parse()
                .map_err(|e: String| CaeError::invalid("overwrite", e))?;
            ctx = ctx.with_overwrite(policy);
        }
        if let Some(pool) = d.pool {
            ctx = ctx.with_pool(PoolId(pool));
        }
        if let Some(job) = d.depends_on.as_deref() {
            let job: JobId = job
                .parse()
                .map_err(|e: String| CaeError::invalid("depends_on", e))?;
            ctx = ctx.with_dependency(job);
        }
        ctx.with_dataset_filter(&d.include_patterns, &d.exclude_patterns)
    }
}

impl From<&AssimilationCtx> for JobDescriptor {
    fn from(ctx: &AssimilationCtx) -> Self {
        Self {
            src: ctx.source.to_string(),
            dst: ctx.destination.to_string(),
            format: ctx.format.to_string(),
            compression_hint: ctx.compression_hint.map(|s| s.to_string()),
            overwrite: ctx.overwrite.map(|p| p.to_string()),
            pool: match ctx.pool_query {
                PoolQuery::Static(id) => Some(id.0),
                PoolQuery::Dynamic => None,
            },
            depends_on: ctx.depends_on.map(|id| id.to_string()),
            include_patterns: ctx
                .dataset_filter()
                .map(DatasetFilter::include_patterns)
                .unwrap_or_default(),
            exclude_patterns: ctx
                .dataset_filter()
                .map(DatasetFilter::exclude_patterns)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wrp_reduce::CodecId;

    fn kind<T: fmt::Debug>(r: CaeResult<T>) -> ErrorKind {
        r.unwrap_err().kind()
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            Source::parse("file::/tmp/a.bin").unwrap(),
            Source::File {
                path: "/tmp/a.bin".into()
            }
        );
        assert_eq!(
            Source::parse("range::/tmp/a.bin[100:50]").unwrap(),
            Source::Range {
                path: "/tmp/a.bin".into(),
                offset: 100,
                size: 50
            }
        );
        assert_eq!(
            Source::parse("hdf5::/data/run.h5:/fields/temp").unwrap(),
            Source::Hdf5 {
                file: "/data/run.h5".into(),
                dataset: Some("/fields/temp".into()),
                filter: DatasetFilter::default(),
            }
        );
        assert_eq!(
            Source::parse("hdf5::/data/run.h5").unwrap(),
            Source::Hdf5 {
                file: "/data/run.h5".into(),
                dataset: None,
                filter: DatasetFilter::default(),
            }
        );
        assert_eq!(
            Source::parse("iowarp::sim::t1").unwrap(),
            Source::Tag(Tag::parse("sim::t1").unwrap())
        );
    }

    #[test]
    fn test_source_display_roundtrip() {
        for s in [
            "file::/tmp/a.bin",
            "range::/tmp/a.bin[0:10]",
            "hdf5::/f.h5:/d",
            "hdf5::/f.h5",
            "iowarp::a::b",
        ] {
            assert_eq!(Source::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_malformed_sources() {
        for bad in [
            "/tmp/a.bin",
            "file::",
            "ftp::/a",
            "range::/a.bin",
            "range::/a.bin[10]",
            "range::/a.bin[x:10]",
            "range::/a.bin[0:0]",
            "range::[0:10]",
            "hdf5:::/d",
            "hdf5::/f.h5:",
            "iowarp::notatag",
        ] {
            assert_eq!(kind(Source::parse(bad)), ErrorKind::InvalidContext, "{bad}");
        }
    }

    #[test]
    fn test_ctx_validation() {
        let ctx = AssimilationCtx::new("file::/tmp/a.bin", "ns::t1", "binary").unwrap();
        assert_eq!(ctx.format(), Format::Binary);
        assert_eq!(ctx.destination().to_string(), "ns::t1");
        assert_eq!(ctx.pool_query(), PoolQuery::Dynamic);
        assert!(ctx.compression_hint().is_none());

        assert_eq!(
            kind(AssimilationCtx::new("file::/a", "ns::t1", "parquet")),
            ErrorKind::InvalidContext
        );
        assert_eq!(
            kind(AssimilationCtx::new("file::/a", "not-a-tag", "binary")),
            ErrorKind::InvalidContext
        );
        assert_eq!(
            kind(AssimilationCtx::new("file::/a", "ns::t1", "hdf5")),
            ErrorKind::InvalidContext
        );
        assert_eq!(
            kind(AssimilationCtx::new("range::/a[0:1]", "ns::t1", "binary")),
            ErrorKind::InvalidContext
        );
        assert_eq!(
            kind(AssimilationCtx::new("iowarp::ns::t1", "ns::t1", "binary")),
            ErrorKind::InvalidContext
        );
    }

    #[test]
    fn test_compression_hint() {
        let ctx = AssimilationCtx::new("file::/a", "ns::t", "binary")
            .unwrap()
            .with_compression_hint("zstd:7")
            .unwrap();
        let hint = ctx.compression_hint().unwrap();
        assert_eq!(hint.codec, CodecId::Zstd);
        assert_eq!(hint.level, 7);

        let bad = AssimilationCtx::new("file::/a", "ns::t", "binary")
            .unwrap()
            .with_compression_hint("brotli");
        assert_eq!(kind(bad), ErrorKind::InvalidContext);
    }

    #[test]
    fn test_descriptor_json() {
        let json = r#"{
            "src": "range::/tmp/a.bin[100:50]",
            "dst": "ns::t1",
            "format": "range",
            "compression_hint": "lz4",
            "overwrite": "append",
            "pool": 4
        }"#;
        let desc = JobDescriptor::from_json(json).unwrap();
        let ctx = AssimilationCtx::try_from(desc.clone()).unwrap();
        assert_eq!(ctx.overwrite(), Some(Reassimilation::Append));
        assert_eq!(ctx.pool_query(), PoolQuery::Static(PoolId(4)));
        assert_eq!(JobDescriptor::from(&ctx), desc);
    }

    #[test]
    fn test_descriptor_rejects() {
        let desc = JobDescriptor {
            src: "file::/a".into(),
            dst: "ns::t".into(),
            format: "binary".into(),
            overwrite: Some("merge".into()),
            ..Default::default()
        };
        assert_eq!(kind(AssimilationCtx::try_from(desc)), ErrorKind::InvalidContext);

        let desc = JobDescriptor {
            src: "file::/a".into(),
            dst: "ns::t".into(),
            format: "binary".into(),
            depends_on: Some("yesterday".into()),
            ..Default::default()
        };
        assert_eq!(kind(AssimilationCtx::try_from(desc)), ErrorKind::InvalidContext);
        assert_eq!(kind(JobDescriptor::from_json("{\"src\": 1}")), ErrorKind::InvalidContext);
    }

    #[test]
    fn test_dataset_filter_and_dependency() {
        let json = r#"{
            "src": "hdf5::/data/run.h5",
            "dst": "ns::fields",
            "format": "hdf5",
            "depends_on": "job-3",
            "include_patterns": ["/fields/*"],
            "exclude_patterns": ["/fields/scratch"]
        }"#;
        let desc = JobDescriptor::from_json(json).unwrap();
        let ctx = AssimilationCtx::try_from(desc.clone()).unwrap();
        assert_eq!(ctx.depends_on(), Some(JobId(3)));
        let filter = ctx.dataset_filter().unwrap();
        assert!(filter.matches("/fields/temp"));
        assert!(!filter.matches("/fields/scratch"));
        assert_eq!(JobDescriptor::from(&ctx), desc);
    }

    #[test]
    fn test_dataset_filter_needs_whole_file_source() {
        for src in ["hdf5::/data/run.h5:/fields/temp", "file::/a"] {
            let format = if src.starts_with("hdf5") { "hdf5" } else { "binary" };
            let ctx = AssimilationCtx::new(src, "ns::t", format).unwrap();
            assert_eq!(
                kind(ctx.clone().with_dataset_filter(&["/x/*"], &[] as &[&str])),
                ErrorKind::InvalidContext
            );
            // No patterns is always fine.
            assert!(ctx.with_dataset_filter(&[] as &[&str], &[] as &[&str]).is_ok());
        }
    }

    #[test]
    fn test_descriptor_list() {
        let json = r#"[
            {"src": "file::/a", "dst": "ns::a", "format": "binary"},
            {"src": "hdf5::/f.h5:/d", "dst": "ns::b", "format": "hdf5"}
        ]"#;
        let list = JobDescriptor::list_from_json(json).unwrap();
        assert_eq!(list.len(), 2);
        let ctxs: Vec<AssimilationCtx> = list
            .into_iter()
            .map(AssimilationCtx::try_from)
            .collect::<CaeResult<_>>()
            .unwrap();
        assert_eq!(ctxs[1].format(), Format::Hdf5);
    }
}
