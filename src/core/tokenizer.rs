//! OSM XML tokenizer
//!
//! Turns an `.osm` XML document into a stream of [`Element`]s in document
//! order. Parsing is synchronous and runs on a blocking thread; elements are
//! handed to the async side through a bounded channel so a slow export holds
//! the parser back instead of buffering the whole extract.

use std::collections::HashMap;
use std::fmt::Display;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::core::element::{Common, Element, ElementType, Member, Point, Relation, Way};
use crate::core::error::{Error, Result};
use crate::core::options::{Events, ExportEvent};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 1024;

/// Pull parser yielding one element per `<node>`, `<way>` or `<relation>`
pub struct OsmXmlReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    current: Option<Element>,
    done: bool,
}

impl<R: BufRead> OsmXmlReader<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            current: None,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for OsmXmlReader<R> {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Eof) => {
                    self.done = true;
                    return self.current.take().map(|open| {
                        Err(Error::Decode(format!(
                            "input ended inside {} {}",
                            open.kind(),
                            open.id()
                        )))
                    });
                }
                Ok(event) => handle_event(&mut self.current, event),
                Err(e) => Err(e.into()),
            };

            match step {
                Ok(Some(element)) => return Some(Ok(element)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn is_element(name: &[u8]) -> bool {
    matches!(name, b"node" | b"way" | b"relation")
}

fn handle_event(current: &mut Option<Element>, event: Event<'_>) -> Result<Option<Element>> {
    match event {
        Event::Start(e) if is_element(e.name().as_ref()) => {
            *current = Some(parse_element(&e)?);
            Ok(None)
        }
        Event::Empty(e) if is_element(e.name().as_ref()) => parse_element(&e).map(Some),
        Event::Start(e) | Event::Empty(e) => {
            parse_child(current, &e)?;
            Ok(None)
        }
        Event::End(e) if is_element(e.name().as_ref()) => Ok(current.take()),
        _ => Ok(None),
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn optional<T>(attrs: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    attrs
        .get(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::Decode(format!("invalid {name} '{raw}': {e}")))
        })
        .transpose()
}

fn required<T>(attrs: &HashMap<String, String>, name: &str, tag: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    optional(attrs, name)?.ok_or_else(|| Error::Decode(format!("<{tag}> without {name}")))
}

/// Coordinates must be finite; `NaN` or `inf` cannot be exported
fn coordinate(attrs: &HashMap<String, String>, name: &str) -> Result<f64> {
    let value: f64 = required(attrs, name, "node")?;
    if !value.is_finite() {
        return Err(Error::Decode(format!("invalid {name} '{value}': not a finite number")));
    }
    Ok(value)
}

/// See <http://wiki.openstreetmap.org/wiki/Data_Primitives#Common_attributes>
fn parse_common(attrs: &HashMap<String, String>, tag: &str) -> Result<Common> {
    let id: i64 = required(attrs, "id", tag)?;
    Ok(Common {
        id,
        key: Some(id.to_string()),
        user: attrs.get("user").cloned(),
        uid: optional(attrs, "uid")?,
        timestamp: attrs.get("timestamp").cloned(),
        visible: attrs
            .get("visible")
            .map_or(true, |v| !v.eq_ignore_ascii_case("false")),
        version: optional(attrs, "version")?,
        changeset: optional(attrs, "changeset")?,
        tags: Default::default(),
    })
}

fn parse_element(e: &BytesStart<'_>) -> Result<Element> {
    let attrs = attributes(e)?;
    let element = match e.name().as_ref() {
        b"node" => Element::Point(Point {
            common: parse_common(&attrs, "node")?,
            lat: coordinate(&attrs, "lat")?,
            lon: coordinate(&attrs, "lon")?,
        }),
        b"way" => Element::Way(Way {
            common: parse_common(&attrs, "way")?,
            nodes: Vec::new(),
        }),
        _ => Element::Relation(Relation {
            common: parse_common(&attrs, "relation")?,
            members: Vec::new(),
        }),
    };
    trace!("parsed {} {}", element.kind(), element.id());
    Ok(element)
}

fn parse_child(current: &mut Option<Element>, e: &BytesStart<'_>) -> Result<()> {
    let Some(element) = current.as_mut() else {
        return Ok(());
    };

    match (e.name().as_ref(), element) {
        (b"tag", element) => {
            let mut attrs = attributes(e)?;
            if let (Some(k), Some(v)) = (attrs.remove("k"), attrs.remove("v")) {
                element.common_mut().tags.insert(k, v);
            }
        }
        (b"nd", Element::Way(way)) => {
            let attrs = attributes(e)?;
            way.nodes.push(required(&attrs, "ref", "nd")?);
        }
        (b"member", Element::Relation(relation)) => {
            let attrs = attributes(e)?;
            let kind: ElementType = required(&attrs, "type", "member")?;
            relation.members.push(Member {
                kind,
                reference: required(&attrs, "ref", "member")?,
                role: attrs.get("role").filter(|role| !role.is_empty()).cloned(),
            });
        }
        _ => {}
    }
    Ok(())
}

/// Reader wrapper counting consumed bytes and reporting progress
pub struct CountingReader<R> {
    inner: R,
    bytes_read: Arc<AtomicU64>,
    total: u64,
    events: Events,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, bytes_read: Arc<AtomicU64>, total: u64, events: Events) -> Self {
        Self {
            inner,
            bytes_read,
            total,
            events,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let bytes = self.bytes_read.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            self.events.emit(ExportEvent::BytesRead {
                bytes,
                total: self.total,
            });
        }
        Ok(n)
    }
}

/// Element stream fed by a tokenizer thread
pub struct XmlInput {
    pub elements: ReceiverStream<Result<Element>>,
    /// Input size when known up front
    pub total_bytes: Option<u64>,
    /// Bytes consumed by the tokenizer so far
    pub bytes_read: Arc<AtomicU64>,
}

/// Tokenize any reader on a blocking thread
pub fn spawn_reader_tokenizer<R>(source: R, total_bytes: Option<u64>, events: Events) -> XmlInput
where
    R: Read + Send + 'static,
{
    let bytes_read = Arc::new(AtomicU64::new(0));
    let counting = CountingReader::new(source, bytes_read.clone(), total_bytes.unwrap_or(0), events);
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let reader = OsmXmlReader::new(BufReader::with_capacity(READ_BUFFER_SIZE, counting));
        for element in reader {
            if tx.blocking_send(element).is_err() {
                debug!("Element receiver dropped, stopping tokenizer");
                break;
            }
        }
    });

    XmlInput {
        elements: ReceiverStream::new(rx),
        total_bytes,
        bytes_read,
    }
}

/// Open an `.osm` file and tokenize it on a blocking thread
pub async fn spawn_tokenizer<P: AsRef<Path>>(path: P, events: Events) -> Result<XmlInput> {
    let path = path.as_ref();
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        Error::InvalidInput(format!("cannot open {}: {e}", path.display()))
    })?;
    let total_bytes = file.metadata().await?.len();
    debug!("Tokenizing {} ({} bytes)", path.display(), total_bytes);

    Ok(spawn_reader_tokenizer(file.into_std().await, Some(total_bytes), events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::io::Write;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="test">
  <bounds minlat="51.0" minlon="4.0" maxlat="52.0" maxlon="5.0"/>
  <node id="1" lat="51.5" lon="4.25" user="mapper" uid="42" version="3" changeset="77" timestamp="2016-01-01T00:00:00Z"/>
  <node id="2" lat="51.6" lon="4.5" visible="False">
    <tag k="railway" v="stop"/>
    <tag k="name" v="Central &amp; Co"/>
  </node>
  <way id="10" visible="true">
    <nd ref="1"/>
    <nd ref="2"/>
    <nd ref="1"/>
    <tag k="highway" v="residential"/>
  </way>
  <relation id="20">
    <member type="node" ref="2" role="stop"/>
    <member type="way" ref="10" role=""/>
    <tag k="type" v="route"/>
  </relation>
</osm>
"#;

    fn parse(xml: &str) -> Vec<Result<Element>> {
        OsmXmlReader::new(xml.as_bytes()).collect()
    }

    #[test]
    fn test_sample_extract_attributes() {
        let elements: Vec<Element> = parse(SAMPLE).into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(elements.len(), 4);

        let Element::Point(first) = &elements[0] else { panic!("expected point") };
        assert_eq!(first.common.id, 1);
        assert_eq!(first.common.key.as_deref(), Some("1"));
        assert_eq!(first.common.user.as_deref(), Some("mapper"));
        assert_eq!(first.common.uid, Some(42));
        assert_eq!(first.common.version, Some(3));
        assert_eq!(first.common.changeset, Some(77));
        assert_eq!(first.common.timestamp.as_deref(), Some("2016-01-01T00:00:00Z"));
        assert!(first.common.visible);
        assert_eq!((first.lat, first.lon), (51.5, 4.25));

        let Element::Point(second) = &elements[1] else { panic!("expected point") };
        assert!(!second.common.visible);
        assert_eq!(second.common.tags["name"], "Central & Co");

        let Element::Way(way) = &elements[2] else { panic!("expected way") };
        assert_eq!(way.nodes, vec![1, 2, 1]);
        assert_eq!(way.common.tags["highway"], "residential");
        assert!(way.common.visible);

        let Element::Relation(relation) = &elements[3] else { panic!("expected relation") };
        assert_eq!(relation.members.len(), 2);
        assert_eq!(relation.members[0].kind, ElementType::Point);
        assert_eq!(relation.members[0].role.as_deref(), Some("stop"));
        assert_eq!(relation.members[1].kind, ElementType::Way);
        assert_eq!(relation.members[1].role, None);
        assert_eq!(relation.common.tags["type"], "route");
    }

    #[test]
    fn test_malformed_id_is_decode_error() {
        let results = parse(r#"<osm><node id="abc" lat="1" lon="2"/><node id="2" lat="1" lon="2"/></osm>"#);
        assert_eq!(results.len(), 1, "parsing stops at the first error");
        assert!(matches!(results[0], Err(Error::Decode(_))));
    }

    #[test]
    fn test_missing_coordinate_is_decode_error() {
        let results = parse(r#"<osm><node id="1" lat="1"/></osm>"#);
        assert!(matches!(results[0], Err(Error::Decode(_))));
    }

    #[test]
    fn test_non_finite_coordinate_is_decode_error() {
        for node in [
            r#"<node id="1" lat="NaN" lon="2"/>"#,
            r#"<node id="1" lat="1" lon="inf"/>"#,
            r#"<node id="1" lat="-infinity" lon="2"/>"#,
        ] {
            let results = parse(&format!("<osm>{node}</osm>"));
            assert!(
                matches!(&results[0], Err(Error::Decode(msg)) if msg.contains("finite")),
                "{node} should be rejected"
            );
        }
    }

    #[test]
    fn test_truncated_input() {
        let results = parse(r#"<osm><way id="3"><nd ref="1"/>"#);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_spawn_tokenizer_streams_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let events = Events::new(Some(Arc::new({
            let progress = progress.clone();
            move |event: &ExportEvent| progress.lock().push(event.clone())
        })));

        let input = spawn_tokenizer(file.path(), events).await.unwrap();
        assert_eq!(input.total_bytes, Some(SAMPLE.len() as u64));

        let kinds: Vec<ElementType> = input
            .elements
            .map(|e| e.unwrap().kind())
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![ElementType::Point, ElementType::Point, ElementType::Way, ElementType::Relation]
        );

        assert_eq!(input.bytes_read.load(Ordering::Relaxed), SAMPLE.len() as u64);
        assert_eq!(
            progress.lock().last(),
            Some(&ExportEvent::BytesRead {
                bytes: SAMPLE.len() as u64,
                total: SAMPLE.len() as u64,
            })
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = spawn_tokenizer("/nonexistent/extract.osm", Events::default()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
