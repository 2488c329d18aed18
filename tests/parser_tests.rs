//! Cursor, attachment, and rule-lookup behavior of the parsing engine.

mod common;

use pretty_assertions::assert_eq;

use xylem::template::{Bindings, Template};
use xylem::{Backend, Config, Grammar, HashCollision, Value, XylemError};

fn parse_with(template: &Template, config: Config, doc: &str) -> xylem::Document {
    let handler = xylem::Handler::new(template, config);
    let mut input = doc.as_bytes();
    handler.run(&mut input, Backend::FALLBACK)
}

fn parse(rules: &str, doc: &str) -> xylem::Document {
    let template = Template::from_yaml(rules, &Bindings::new()).expect("rule data compiles");
    parse_with(&template, Config::default(), doc)
}

#[test]
fn rows_collect_in_document_order() {
    let doc = parse(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
  attributes:
  - name: id
"#,
        r#"<root><row id="1"/><row id="2"/></root>"#,
    );
    assert!(doc.is_clean(), "errors: {:?}", doc.errors);
    let rows = doc.root.dig(&["rows"]).and_then(Value::as_list).expect("rows list");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].dig(&["id"]).and_then(Value::as_str), Some("1"));
    assert_eq!(rows[1].dig(&["id"]).and_then(Value::as_str), Some("2"));
}

#[test]
fn parsing_identical_bytes_twice_is_idempotent() {
    let rules = r#"
elements:
- name: row
  attach: array
  as_name: rows
  attributes:
  - name: id
"#;
    let doc = r#"<root><row id="1"/><row id="2"/></root>"#;
    let first = parse(rules, doc);
    let second = parse(rules, doc);
    assert_eq!(first.root, second.root);
}

#[test]
fn array_siblings_stay_addressable_by_delimiter_in_order() {
    let doc = parse(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
  delimiter: key
"#,
        r#"<root><row key="a"/><row key="b"/><row key="c"/></root>"#,
    );
    let rows = doc.root.dig(&["rows"]).expect("rows");
    let keys: Vec<&str> = rows
        .as_list()
        .unwrap()
        .iter()
        .map(|r| r.dig(&["key"]).and_then(Value::as_str).unwrap())
        .collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    for key in ["a", "b", "c"] {
        assert!(rows.entry_by("key", key).is_some(), "missing entry {key}");
    }
}

#[test]
fn hash_collisions_default_to_last_write_wins() {
    let rules = r#"
elements:
- name: row
  attach: hash
  as_name: rows
  delimiter: key
  attributes:
  - name: seq
"#;
    let doc = parse(
        rules,
        r#"<root><row key="a" seq="1"/><row key="b" seq="2"/><row key="a" seq="3"/></root>"#,
    );
    let rows = doc.root.dig(&["rows"]).and_then(Value::as_object).expect("rows map");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.get("a").unwrap().dig(&["seq"]).and_then(Value::as_str), Some("3"));
    assert_eq!(rows.get("b").unwrap().dig(&["seq"]).and_then(Value::as_str), Some("2"));
}

#[test]
fn hash_collisions_can_merge() {
    let rules = r#"
elements:
- name: row
  attach: hash
  as_name: rows
  delimiter: key
  attributes:
  - name: first
  - name: second
"#;
    let template = Template::from_yaml(rules, &Bindings::new()).unwrap();
    let config = Config::default().with_hash_collisions(HashCollision::Merge);
    let doc = parse_with(
        &template,
        config,
        r#"<root><row key="a" first="1"/><row key="a" second="2"/></root>"#,
    );
    let merged = doc.root.dig(&["rows", "a"]).expect("merged entry");
    assert_eq!(merged.dig(&["first"]).and_then(Value::as_str), Some("1"));
    assert_eq!(merged.dig(&["second"]).and_then(Value::as_str), Some("2"));
}

#[test]
fn unmatched_tags_inherit_the_ancestor_default() {
    // No rule matches anything; the root's attach_elements default governs.
    let doc = parse(
        r#"
attach_elements: shared
attach_attributes: private
"#,
        r#"<library><book title="Dune"/><book title="Emma"/></library>"#,
    );
    let books = doc.root.dig(&["library"]).and_then(Value::as_list).expect("library list");
    assert_eq!(books.len(), 1);
    let inner = books[0].dig(&["book"]).and_then(Value::as_list).expect("book list");
    assert_eq!(inner.len(), 2);
    assert_eq!(inner[0].dig(&["title"]).and_then(Value::as_str), Some("Dune"));
}

#[test]
fn transparent_elements_route_attributes_to_the_logical_parent() {
    let doc = parse(
        r#"
elements:
- name: wrapper
  attach: none
  elements:
  - name: error
    attach: none
    attributes:
    - name: code
      as_name: error
"#,
        r#"<root><wrapper><error code="401"/></wrapper></root>"#,
    );
    assert_eq!(doc.root.dig(&["error"]).and_then(Value::as_str), Some("401"));
}

#[test]
fn private_attachment_stores_one_named_slot() {
    let doc = parse(
        r#"
elements:
- name: info
  attach: private
  as_name: details
  attributes:
  - name: version
"#,
        r#"<root><info version="7"/></root>"#,
    );
    assert_eq!(doc.root.dig(&["details", "version"]).and_then(Value::as_str), Some("7"));
}

#[test]
fn text_lands_under_the_reserved_label_and_whitespace_is_ignored() {
    let doc = parse(
        r#"
elements:
- name: note
  attach: array
  as_name: notes
"#,
        "<root>\n  <note>hello</note>\n  <note>  </note>\n</root>",
    );
    let notes = doc.root.dig(&["notes"]).and_then(Value::as_list).unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].dig(&["text"]).and_then(Value::as_str), Some("hello"));
    // Whitespace-only content stores nothing.
    assert!(notes[1].dig(&["text"]).is_none());
}

#[test]
fn compact_collapses_text_only_elements() {
    let doc = parse(
        r#"
elements:
- name: name
  attach: array
  as_name: names
  compact: true
"#,
        "<root><name>alpha</name><name>beta</name></root>",
    );
    let names = doc.root.dig(&["names"]).and_then(Value::as_list).unwrap();
    assert_eq!(names[0].as_str(), Some("alpha"));
    assert_eq!(names[1].as_str(), Some("beta"));
}

#[test]
fn accessors_declared_once_across_repeats() {
    let doc = parse(
        r#"
create_accessors: all
elements:
- name: row
  attach: array
  as_name: rows
"#,
        "<root><row/><row/><row/></root>",
    );
    let root = doc.root.as_object().unwrap();
    assert_eq!(root.accessors(), &["rows".to_string()]);
}

#[test]
fn premature_end_of_stream_is_a_parse_error_not_a_silent_truncation() {
    let doc = parse(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
"#,
        "<root><row/><row>",
    );
    assert!(!doc.is_clean());
    assert!(doc.errors.iter().any(|e| matches!(e.error, XylemError::Parse { .. })));
    // The partial tree is still there.
    assert!(doc.root.dig(&["rows"]).is_some());
}

#[test]
fn mismatched_close_is_recorded_and_recovered() {
    let doc = parse(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
"#,
        "<root><row><extra></row></root>",
    );
    assert!(doc.errors.iter().any(|e| e.error.to_string().contains("extra")));
    assert_eq!(doc.root.dig(&["rows"]).and_then(Value::as_list).map(<[Value]>::len), Some(1));
}

#[test]
fn abort_on_error_stops_early_and_keeps_the_partial_result() {
    let template = Template::from_yaml(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
"#,
        &Bindings::new(),
    )
    .unwrap();
    let config = Config::default().abort_on_error(true);
    let doc = parse_with(&template, config, "<root><row/><bad></root><row/></root>");
    assert!(doc.aborted);
    assert_eq!(doc.errors.len(), 1);
    // Only the first row made it before the stop.
    assert_eq!(doc.root.dig(&["rows"]).and_then(Value::as_list).map(<[Value]>::len), Some(1));
}

#[test]
fn deferred_construction_passes_buffered_attributes_to_the_constructor() {
    let bindings = Bindings::new().ctor("labeled", |ctx| {
        let mut obj = xylem::Object::with_class("labeled");
        let label = ctx
            .attrs
            .iter()
            .find(|(name, _)| name == "label")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        obj.set("ctor_saw", Value::String(label));
        Value::Object(obj)
    });
    let template = Template::from_yaml(
        r#"
elements:
- name: item
  attach: [array, labeled, new]
  as_name: items
"#,
        &bindings,
    )
    .unwrap();
    let doc = parse_with(
        &template,
        Config::default(),
        r#"<root><item label="x" other="y"/></root>"#,
    );
    let item = &doc.root.dig(&["items"]).and_then(Value::as_list).unwrap()[0];
    assert_eq!(item.dig(&["ctor_saw"]).and_then(Value::as_str), Some("x"));
    // Buffered attributes are replayed through normal storage afterwards.
    assert_eq!(item.dig(&["other"]).and_then(Value::as_str), Some("y"));
}

#[test]
fn before_close_failure_is_recorded_and_the_cursor_still_pops() {
    let bindings = Bindings::new().callback("explode", |_ctx| {
        Err(XylemError::parse("boom"))
    });
    let template = Template::from_yaml(
        r#"
elements:
- name: row
  attach: array
  as_name: rows
  before_close: explode
"#,
        &bindings,
    )
    .unwrap();
    let doc = parse_with(&template, Config::default(), "<root><row/><row/></root>");
    assert_eq!(doc.errors.len(), 2);
    // Attachment still happened for both rows.
    assert_eq!(doc.root.dig(&["rows"]).and_then(Value::as_list).map(<[Value]>::len), Some(2));
}

#[test]
fn cursor_policy_objects_never_merge_upward() {
    let bindings = Bindings::new().callback("lift_count", |ctx| {
        let count = ctx.object.dig(&["n"]).and_then(Value::as_str).unwrap_or("0").to_string();
        if let Some(parent) = ctx.parent.as_mut() {
            if let Value::Object(parent) = &mut **parent {
                parent.set("lifted", Value::String(count));
            }
        }
        Ok(())
    });
    let template = Template::from_yaml(
        r#"
elements:
- name: scratch
  attach: cursor
  before_close: lift_count
  attributes:
  - name: n
"#,
        &bindings,
    )
    .unwrap();
    let doc = parse_with(&template, Config::default(), r#"<root><scratch n="5"/></root>"#);
    // The callback saw the object; the tree did not.
    assert_eq!(doc.root.dig(&["lifted"]).and_then(Value::as_str), Some("5"));
    assert!(doc.root.dig(&["scratch"]).is_none());
}

#[test]
fn doctype_and_cdata_are_normalized_into_one_path() {
    let doc = parse(
        r#"
elements:
- name: doctype
  attach: none
  attributes:
  - name: value
    as_name: doctype
- name: cdata
  attach: none
  attributes:
  - name: text
    as_name: raw
"#,
        "<!DOCTYPE catalog><catalog><![CDATA[1 < 2]]></catalog>",
    );
    assert_eq!(doc.root.dig(&["doctype"]).and_then(Value::as_str), Some("catalog"));
    assert_eq!(doc.root.dig(&["raw"]).and_then(Value::as_str), Some("1 < 2"));
}

#[test]
fn generic_template_builds_a_tag_keyed_tree() {
    let template = Template::generic();
    let doc = parse_with(
        &template,
        Config::default(),
        r#"<order id="9"><line sku="a"/><line sku="b"/></order>"#,
    );
    let orders = doc.root.dig(&["order"]).and_then(Value::as_list).unwrap();
    assert_eq!(orders[0].dig(&["id"]).and_then(Value::as_str), Some("9"));
    let lines = orders[0].dig(&["line"]).and_then(Value::as_list).unwrap();
    assert_eq!(lines.len(), 2);
}

#[test]
fn builtin_record_grammar_parses_the_full_sample() {
    let template = xylem::grammars::template_for(Grammar::FmResultset);
    let doc = parse_with(&template, Config::default(), common::RESULTSET_XML);
    assert!(doc.is_clean(), "errors: {:?}", doc.errors);

    assert_eq!(doc.root.dig(&["error"]).and_then(Value::as_str), Some("0"));
    assert_eq!(doc.root.dig(&["count"]).and_then(Value::as_str), Some("2"));
    assert_eq!(
        doc.root.dig(&["datasource", "database"]).and_then(Value::as_str),
        Some("orders")
    );
    assert_eq!(
        doc.root.dig(&["field_meta", "amount", "result"]).and_then(Value::as_str),
        Some("number")
    );

    let records = doc.root.dig(&["records"]).and_then(Value::as_list).expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].dig(&["record_id"]).and_then(Value::as_str), Some("11"));
    assert_eq!(records[0].dig(&["status"]).and_then(Value::as_str), Some("open"));
    assert_eq!(records[1].dig(&["amount"]).and_then(Value::as_str), Some("8.00"));

    let portal = records[1].dig(&["portals", "items"]).expect("items portal");
    let portal_rows = portal.dig(&["records"]).and_then(Value::as_list).unwrap();
    assert_eq!(portal_rows[0].dig(&["items::desc"]).and_then(Value::as_str), Some("widget"));
}

#[test]
fn builtin_listing_grammar_flattens_rows_into_values() {
    let template = xylem::grammars::template_for(Grammar::FmpXmlResult);
    let doc = parse_with(&template, Config::default(), common::LISTING_XML);
    assert!(doc.is_clean(), "errors: {:?}", doc.errors);
    assert_eq!(doc.root.dig(&["error"]).and_then(Value::as_str), Some("0"));
    assert_eq!(doc.root.dig(&["count"]).and_then(Value::as_str), Some("2"));
    let values: Vec<&str> = doc
        .root
        .dig(&["values"])
        .and_then(Value::as_list)
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["orders", "crm"]);
}

#[test]
fn builtin_layout_grammar_keys_styles_and_value_lists() {
    let template = xylem::grammars::template_for(Grammar::FmpXmlLayout);
    let doc = parse_with(&template, Config::default(), common::LAYOUT_XML);
    assert!(doc.is_clean(), "errors: {:?}", doc.errors);
    assert_eq!(doc.root.dig(&["layout_name"]).and_then(Value::as_str), Some("order_list"));
    assert_eq!(
        doc.root.dig(&["field_styles", "status", "type"]).and_then(Value::as_str),
        Some("POPUPLIST")
    );
    let values: Vec<&str> = doc
        .root
        .dig(&["value_lists", "statuses", "values"])
        .and_then(Value::as_list)
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["open", "closed"]);
}
