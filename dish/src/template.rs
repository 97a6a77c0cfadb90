//! Command and path templates.
//!
//! The grammar is deliberately small:
//!
//! ```text
//! template    := (literal | placeholder | "{{" | "}}")*
//! placeholder := "{" name "}" | "{" name "[" digits "]" "}"
//! name        := [A-Za-z_][A-Za-z0-9_]*
//! ```
//!
//! Templates are parsed once per stage and expanded per job. Expansion is
//! pure: the same template against an unchanged record yields the same text.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::errors::TemplateError;
use crate::job::{FieldValue, JobRecord};

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\[([0-9]+)\])?$").expect("placeholder regex is valid")
    })
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text copied verbatim.
    Literal(String),
    /// `{name}`
    Field(String),
    /// `{name[index]}`
    Indexed(String, usize),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses a template.
    ///
    /// # Errors
    ///
    /// Returns a `TemplateError` for unbalanced braces or placeholders that
    /// are not `name` or `name[index]`.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        body.push(inner);
                    }
                    if !closed {
                        return Err(TemplateError::Unclosed {
                            template: source.to_string(),
                            offset,
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(source, &body)?);
                }
                '}' => {
                    return Err(TemplateError::Unmatched {
                        template: source.to_string(),
                        offset,
                    });
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Returns the original template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the field names referenced by this template, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Literal(_) => None,
            Segment::Field(name) | Segment::Indexed(name, _) => Some(name.as_str()),
        })
    }

    /// Expands the template against a job record.
    ///
    /// # Errors
    ///
    /// Returns a `TemplateError` naming the field and the job when a
    /// placeholder is missing, not indexable, or out of range.
    pub fn expand(&self, job: &JobRecord) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = lookup(job, name)?;
                    out.push_str(&value.to_string());
                }
                Segment::Indexed(name, index) => {
                    let value = lookup(job, name)?;
                    let items = value.as_list().ok_or_else(|| TemplateError::NotIndexable {
                        field: name.clone(),
                        job: job.description().to_string(),
                    })?;
                    let item = items.get(*index).ok_or_else(|| TemplateError::IndexOutOfRange {
                        field: name.clone(),
                        index: *index,
                        len: items.len(),
                        job: job.description().to_string(),
                    })?;
                    out.push_str(item);
                }
            }
        }

        Ok(out)
    }
}

fn lookup(job: &JobRecord, name: &str) -> Result<FieldValue, TemplateError> {
    job.lookup(name).ok_or_else(|| TemplateError::MissingField {
        field: name.to_string(),
        job: job.description().to_string(),
    })
}

fn parse_placeholder(source: &str, body: &str) -> Result<Segment, TemplateError> {
    let malformed = || TemplateError::Malformed {
        template: source.to_string(),
        placeholder: body.to_string(),
    };

    let captures = placeholder_pattern().captures(body).ok_or_else(malformed)?;
    let name = captures[1].to_string();

    match captures.get(2) {
        Some(index) => {
            let index = index.as_str().parse::<usize>().map_err(|_| malformed())?;
            Ok(Segment::Indexed(name, index))
        }
        None => Ok(Segment::Field(name)),
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn job() -> JobRecord {
        let mut job = JobRecord::new("sample-1")
            .with_field("tarball", "a.tar.gz")
            .with_field("fastqs", vec!["r1.fastq", "r2.fastq"])
            .with_field("threads", 8);
        job.set_workdir(PathBuf::from("/work/sample-1"));
        job
    }

    #[test]
    fn test_parse_segments() {
        let t = Template::parse("tar xvzf {tarball} -C {workdir}").unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::Literal("tar xvzf ".to_string()),
                Segment::Field("tarball".to_string()),
                Segment::Literal(" -C ".to_string()),
                Segment::Field("workdir".to_string()),
            ]
        );
        assert_eq!(t.fields().collect::<Vec<_>>(), vec!["tarball", "workdir"]);
    }

    #[test]
    fn test_expand_scalars_and_indexes() {
        let t = Template::parse("trim -t {threads} {workdir}/{fastqs[0]} {fastqs[1]}.trimmed").unwrap();
        assert_eq!(
            t.expand(&job()).unwrap(),
            "trim -t 8 /work/sample-1/r1.fastq r2.fastq.trimmed"
        );
    }

    #[test]
    fn test_expand_is_pure() {
        let t = Template::parse("{description}:{fastqs}").unwrap();
        let j = job();
        let first = t.expand(&j).unwrap();
        let second = t.expand(&j).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "sample-1:r1.fastq r2.fastq");
    }

    #[test]
    fn test_escaped_braces() {
        let t = Template::parse("awk '{{print $1}}' {tarball}").unwrap();
        assert_eq!(t.expand(&job()).unwrap(), "awk '{print $1}' a.tar.gz");
    }

    #[test]
    fn test_missing_field() {
        let t = Template::parse("{fastq1}.trimmed").unwrap();
        let err = t.expand(&job()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingField {
                field: "fastq1".to_string(),
                job: "sample-1".to_string(),
            }
        );
    }

    #[test]
    fn test_index_errors() {
        let out_of_range = Template::parse("{fastqs[2]}").unwrap().expand(&job()).unwrap_err();
        assert!(matches!(out_of_range, TemplateError::IndexOutOfRange { index: 2, len: 2, .. }));

        let scalar = Template::parse("{tarball[0]}").unwrap().expand(&job()).unwrap_err();
        assert!(matches!(scalar, TemplateError::NotIndexable { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Template::parse("tar {tarball"),
            Err(TemplateError::Unclosed { offset: 4, .. })
        ));
        assert!(matches!(
            Template::parse("a } b"),
            Err(TemplateError::Unmatched { offset: 2, .. })
        ));
        assert!(matches!(Template::parse("{}"), Err(TemplateError::Malformed { .. })));
        assert!(matches!(Template::parse("{a b}"), Err(TemplateError::Malformed { .. })));
        assert!(matches!(Template::parse("{a[-1]}"), Err(TemplateError::Malformed { .. })));
    }

    #[test]
    fn test_display_round_trips_source() {
        let t: Template = "bowtie2 -S {description}.sam".parse().unwrap();
        assert_eq!(t.to_string(), "bowtie2 -S {description}.sam");
    }
}
