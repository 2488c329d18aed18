//! Event source adapters: a uniform event contract over XML tokenizers.
//!
//! Every backend surfaces exactly the same event set — doctype, open,
//! attribute, text, cdata, close, and non-fatal error — regardless of what
//! the underlying tokenizer reports. Backends are a closed enum resolved by
//! a prioritized probe at run start; swapping one in or out never changes
//! the event contract the handler sees.
//!
//! Drivers pull from an `io::Read`, so when the byte source is the
//! streaming transport's pipe, tokenizer progress blocks on network arrival
//! and backpressure falls out of the read call itself.

use std::io::{BufReader, Read};

use tracing::debug;

use crate::errors::{Result, XylemError};

/// The fixed event set every adapter emits.
#[derive(Debug, Clone, PartialEq)]
pub enum SaxEvent {
    Doctype(String),
    Open { tag: String },
    Attribute { name: String, value: String },
    Text(String),
    CData(String),
    Close { tag: String },
    /// Recoverable tokenizer problem; accumulated, never raised.
    Error(String),
}

/// Continue/stop signal returned by a sink for each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

impl Flow {
    pub fn is_stop(self) -> bool {
        matches!(self, Flow::Stop)
    }
}

/// Receives the event stream. Implemented by the handler.
pub trait EventSink {
    fn event(&mut self, event: SaxEvent) -> Flow;
}

/// Known tokenizer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    QuickXml,
    #[cfg(feature = "xml-rs")]
    XmlRs,
}

/// Probe order when no preference is given. Unavailable names are skipped;
/// the fallback is always compiled in.
const PRIORITY: &[&str] = &["quick-xml", "xml-rs"];

impl Backend {
    /// Always available, whatever the feature set.
    pub const FALLBACK: Backend = Backend::QuickXml;

    pub fn name(self) -> &'static str {
        match self {
            Backend::QuickXml => "quick-xml",
            #[cfg(feature = "xml-rs")]
            Backend::XmlRs => "xml-rs",
        }
    }

    fn by_name(name: &str) -> Option<Backend> {
        match name {
            "quick-xml" | "quick_xml" => Some(Backend::QuickXml),
            #[cfg(feature = "xml-rs")]
            "xml-rs" | "xml_rs" | "xml" => Some(Backend::XmlRs),
            _ => None,
        }
    }

    /// Resolve a backend: exact preferred name, then priority order, then
    /// the guaranteed fallback. An explicitly requested name that is not
    /// compiled in is a configuration error, not a silent substitution.
    pub fn probe(preferred: Option<&str>) -> Result<Backend> {
        if let Some(name) = preferred {
            return Backend::by_name(name).ok_or_else(|| {
                XylemError::config(format!("unknown or unavailable backend '{name}'"))
            });
        }
        for name in PRIORITY {
            if let Some(backend) = Backend::by_name(name) {
                return Ok(backend);
            }
        }
        Ok(Backend::FALLBACK)
    }

    /// Drive `sink` with events tokenized from `input` until end of stream,
    /// a fatal tokenizer error, or the sink asks to stop.
    pub fn run(self, input: &mut dyn Read, sink: &mut dyn EventSink) -> Result<()> {
        debug!(backend = self.name(), "starting event source");
        match self {
            Backend::QuickXml => quick::run(input, sink),
            #[cfg(feature = "xml-rs")]
            Backend::XmlRs => xmlrs::run(input, sink),
        }
    }
}

/// Decode character and predefined entity references in raw text, keeping
/// unknown references literal and reporting their names.
fn resolve_entities(raw: &str) -> (String, Vec<String>) {
    if !raw.contains('&') {
        return (raw.to_string(), Vec::new());
    }
    let mut out = String::with_capacity(raw.len());
    let mut unknown = Vec::new();
    let mut rest = raw;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        match rest.find(';') {
            Some(end) if end > 0 && end <= 10 => {
                let name = &rest[..end];
                match decode_entity(name) {
                    Some(ch) => out.push(ch),
                    None => {
                        unknown.push(name.to_string());
                        out.push('&');
                        out.push_str(name);
                        out.push(';');
                    }
                }
                rest = &rest[end + 1..];
            }
            // Dangling ampersand: keep it literal.
            _ => out.push('&'),
        }
    }
    out.push_str(rest);
    (out, unknown)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

mod quick {
    //! Driver over the quick-xml pull reader.

    use quick_xml::events::{BytesStart, Event};
    use quick_xml::Reader;

    use super::*;

    /// Emit open + attribute events for a start tag. Returns `Stop` when
    /// the sink does.
    fn start_element(e: &BytesStart<'_>, sink: &mut dyn EventSink) -> Flow {
        let tag = lossy(e.name().as_ref());
        if sink.event(SaxEvent::Open { tag }).is_stop() {
            return Flow::Stop;
        }
        for attr in e.attributes() {
            match attr {
                Ok(attr) => {
                    let name = lossy(attr.key.as_ref());
                    let (value, unknown) = resolve_entities(&lossy(&attr.value));
                    for entity in unknown {
                        let report = SaxEvent::Error(format!(
                            "unknown entity '&{entity};' in attribute '{name}'"
                        ));
                        if sink.event(report).is_stop() {
                            return Flow::Stop;
                        }
                    }
                    if sink.event(SaxEvent::Attribute { name, value }).is_stop() {
                        return Flow::Stop;
                    }
                }
                Err(e) => {
                    let report = SaxEvent::Error(format!("malformed attribute: {e}"));
                    if sink.event(report).is_stop() {
                        return Flow::Stop;
                    }
                }
            }
        }
        Flow::Continue
    }

    pub(super) fn run(input: &mut dyn Read, sink: &mut dyn EventSink) -> Result<()> {
        let mut reader = Reader::from_reader(BufReader::new(input));
        let config = reader.config_mut();
        // Empty elements become open/close pairs; end-name matching is the
        // cursor stack's job, which records mismatches instead of dying.
        config.expand_empty_elements = true;
        config.check_end_names = false;

        let mut buf = Vec::new();
        loop {
            let flow = match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => start_element(&e, sink),
                Ok(Event::Empty(e)) => {
                    // Unreachable with expand_empty_elements, kept for safety.
                    let tag = lossy(e.name().as_ref());
                    let flow = start_element(&e, sink);
                    if flow.is_stop() {
                        Flow::Stop
                    } else {
                        sink.event(SaxEvent::Close { tag })
                    }
                }
                Ok(Event::End(e)) => {
                    sink.event(SaxEvent::Close { tag: lossy(e.name().as_ref()) })
                }
                Ok(Event::Text(e)) => {
                    let (text, unknown) = resolve_entities(&lossy(&e));
                    let mut flow = Flow::Continue;
                    for entity in unknown {
                        let report =
                            SaxEvent::Error(format!("unknown entity '&{entity};' in text"));
                        if sink.event(report).is_stop() {
                            flow = Flow::Stop;
                            break;
                        }
                    }
                    if flow.is_stop() {
                        Flow::Stop
                    } else {
                        sink.event(SaxEvent::Text(text))
                    }
                }
                Ok(Event::CData(e)) => sink.event(SaxEvent::CData(lossy(&e))),
                Ok(Event::DocType(e)) => {
                    sink.event(SaxEvent::Doctype(lossy(&e).trim().to_string()))
                }
                Ok(Event::Eof) => return Ok(()),
                // Comments, processing instructions, xml declarations.
                Ok(_) => Flow::Continue,
                Err(e) => {
                    // Anything the tokenizer cannot continue past is fatal.
                    return Err(XylemError::parse(format!("xml tokenizer: {e}")));
                }
            };
            if flow.is_stop() {
                return Ok(());
            }
            buf.clear();
        }
    }
}

#[cfg(feature = "xml-rs")]
mod xmlrs {
    //! Driver over the xml-rs pull reader. This tokenizer resolves entity
    //! references itself and reports no doctype events.

    use xml::reader::{EventReader, XmlEvent};

    use super::*;

    pub(super) fn run(input: &mut dyn Read, sink: &mut dyn EventSink) -> Result<()> {
        let mut parser = EventReader::new(input);
        loop {
            let flow = match parser.next() {
                Ok(XmlEvent::StartElement { name, attributes, .. }) => {
                    let mut flow = sink.event(SaxEvent::Open { tag: name.local_name });
                    if !flow.is_stop() {
                        for attr in attributes {
                            flow = sink.event(SaxEvent::Attribute {
                                name: attr.name.local_name,
                                value: attr.value,
                            });
                            if flow.is_stop() {
                                break;
                            }
                        }
                    }
                    flow
                }
                Ok(XmlEvent::EndElement { name }) => {
                    sink.event(SaxEvent::Close { tag: name.local_name })
                }
                Ok(XmlEvent::Characters(text)) => sink.event(SaxEvent::Text(text)),
                Ok(XmlEvent::CData(data)) => sink.event(SaxEvent::CData(data)),
                Ok(XmlEvent::Whitespace(_)) => Flow::Continue,
                Ok(XmlEvent::EndDocument) => return Ok(()),
                Ok(_) => Flow::Continue,
                Err(e) => return Err(XylemError::parse(format!("xml tokenizer: {e}"))),
            };
            if flow.is_stop() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Vec<SaxEvent>);

    impl EventSink for Collect {
        fn event(&mut self, event: SaxEvent) -> Flow {
            self.0.push(event);
            Flow::Continue
        }
    }

    fn events_for(doc: &str) -> Vec<SaxEvent> {
        let mut sink = Collect::default();
        let mut input = doc.as_bytes();
        Backend::QuickXml.run(&mut input, &mut sink).unwrap();
        sink.0
    }

    #[test]
    fn basic_event_sequence() {
        let events = events_for(r#"<a x="1">hi<child/></a>"#);
        assert_eq!(
            events,
            vec![
                SaxEvent::Open { tag: "a".into() },
                SaxEvent::Attribute { name: "x".into(), value: "1".into() },
                SaxEvent::Text("hi".into()),
                SaxEvent::Open { tag: "child".into() },
                SaxEvent::Close { tag: "child".into() },
                SaxEvent::Close { tag: "a".into() },
            ]
        );
    }

    #[test]
    fn entities_resolved_in_text_and_attributes() {
        let events = events_for(r#"<a note="x &amp; y">1 &lt; 2 &#65;</a>"#);
        assert!(events.contains(&SaxEvent::Attribute {
            name: "note".into(),
            value: "x & y".into()
        }));
        assert!(events.contains(&SaxEvent::Text("1 < 2 A".into())));
    }

    #[test]
    fn unknown_entity_is_nonfatal() {
        let events = events_for("<a>&bogus;</a>");
        assert!(events
            .iter()
            .any(|e| matches!(e, SaxEvent::Error(msg) if msg.contains("bogus"))));
        assert!(events.contains(&SaxEvent::Text("&bogus;".into())));
    }

    #[test]
    fn cdata_passes_through_unresolved() {
        let events = events_for("<a><![CDATA[1 &amp; <2>]]></a>");
        assert!(events.contains(&SaxEvent::CData("1 &amp; <2>".into())));
    }

    #[test]
    fn doctype_is_surfaced() {
        let events = events_for("<!DOCTYPE note><note/>");
        assert!(events.contains(&SaxEvent::Doctype("note".into())));
    }

    #[test]
    fn probe_defaults_to_fallback() {
        assert_eq!(Backend::probe(None).unwrap(), Backend::QuickXml);
    }

    #[test]
    fn probe_rejects_unknown_name() {
        assert!(Backend::probe(Some("libxml")).is_err());
    }

    #[test]
    fn probe_accepts_known_aliases() {
        assert_eq!(Backend::probe(Some("quick_xml")).unwrap(), Backend::QuickXml);
    }

    #[test]
    fn resolve_entities_keeps_dangling_ampersand() {
        let (text, unknown) = resolve_entities("a & b");
        assert_eq!(text, "a & b");
        assert!(unknown.is_empty());
    }

    #[test]
    fn resolve_entities_hex_reference() {
        let (text, unknown) = resolve_entities("&#x41;&#x42;");
        assert_eq!(text, "AB");
        assert!(unknown.is_empty());
    }
}
