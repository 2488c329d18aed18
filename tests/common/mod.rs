//! Shared helpers for the integration suites: a canned-response HTTP
//! server on a local listener, plus sample documents for the built-in
//! grammars.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::thread;

/// Serves one canned response per accepted connection, in order, recording
/// each request (head + body) for assertions.
pub struct TestServer {
    pub addr: SocketAddr,
    pub requests: Receiver<String>,
}

pub fn serve(responses: Vec<String>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let (tx, rx) = channel();
    thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else { return };
            let request = read_request(&mut stream);
            let _ = tx.send(request);
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    TestServer { addr, requests: rx }
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    let _ = stream.read_exact(&mut body);
    format!("{head}{}", String::from_utf8_lossy(&body))
}

pub fn ok_xml(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml; charset=UTF-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

pub fn chunked_xml(chunks: &[&str]) -> String {
    let mut response = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml; charset=UTF-8\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    for chunk in chunks {
        response.push_str(&format!("{:x}\r\n{chunk}\r\n", chunk.len()));
    }
    response.push_str("0\r\n\r\n");
    response
}

pub fn redirect_to(location: &str) -> String {
    format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n")
}

pub fn status_only(status: u16, reason: &str) -> String {
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n")
}

/// A full record-grammar response: two records, field metadata, a portal.
pub const RESULTSET_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE fmresultset>
<fmresultset xmlns="http://www.filemaker.com/xml/fmresultset" version="1.0">
<error code="0"/>
<product build="03/05/2024" name="Server" version="20.0.1"/>
<datasource database="orders" date-format="MM/dd/yyyy" layout="order_list" table="orders" time-format="HH:mm:ss" timestamp-format="MM/dd/yyyy HH:mm:ss" total-count="2"/>
<metadata>
<field-definition name="status" result="text" type="normal" not-empty="no" max-repeat="1"/>
<field-definition name="amount" result="number" type="normal" not-empty="no" max-repeat="1"/>
</metadata>
<resultset count="2" fetch-size="2">
<record mod-id="1" record-id="11">
<field name="status"><data>open</data></field>
<field name="amount"><data>17.50</data></field>
</record>
<record mod-id="3" record-id="12">
<field name="status"><data>closed</data></field>
<field name="amount"><data>8.00</data></field>
<relatedset count="1" table="items">
<record mod-id="0" record-id="31">
<field name="items::desc"><data>widget</data></field>
</record>
</relatedset>
</record>
</resultset>
</fmresultset>"#;

/// A names/rows listing response, as the databases command receives it.
pub const LISTING_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FMPXMLRESULT xmlns="http://www.filemaker.com/fmpxmlresult">
<ERRORCODE>0</ERRORCODE>
<PRODUCT BUILD="03/05/2024" NAME="Server" VERSION="20.0.1"/>
<DATABASE DATEFORMAT="MM/dd/yyyy" LAYOUT="" NAME="" RECORDS="0" TIMEFORMAT="HH:mm:ss"/>
<METADATA>
<FIELD EMPTYOK="YES" MAXREPEAT="1" NAME="DATABASE_NAME" TYPE="TEXT"/>
</METADATA>
<RESULTSET FOUND="2">
<ROW MODID="0" RECORDID="1"><COL><DATA>orders</DATA></COL></ROW>
<ROW MODID="0" RECORDID="2"><COL><DATA>crm</DATA></COL></ROW>
</RESULTSET>
</FMPXMLRESULT>"#;

/// A layout-metadata response.
pub const LAYOUT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FMPXMLLAYOUT xmlns="http://www.filemaker.com/fmpxmllayout">
<ERRORCODE>0</ERRORCODE>
<PRODUCT BUILD="03/05/2024" NAME="Server" VERSION="20.0.1"/>
<LAYOUT DATABASE="orders" NAME="order_list">
<FIELD NAME="status"><STYLE TYPE="POPUPLIST" VALUELIST="statuses"/></FIELD>
<FIELD NAME="amount"><STYLE TYPE="EDITTEXT" VALUELIST=""/></FIELD>
</LAYOUT>
<VALUELISTS>
<VALUELIST NAME="statuses"><VALUE>open</VALUE><VALUE>closed</VALUE></VALUELIST>
</VALUELISTS>
</FMPXMLLAYOUT>"#;
