//! IPP / eSCL capability probes run once at device-instance init to
//! populate DNS-SD TXT records: two read-only requests,
//! Get-Printer-Attributes and eSCL ScannerCapabilities, issued over the
//! transport's round-tripper. `scan_xml_field` below is intentionally the
//! simplest possible eSCL XML reader: pull one leaf's text content by tag
//! name. It has no ambition to be a general XML parser.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use http::Request;
use hyper::body::HttpBody;
use tokio_util::sync::CancellationToken;

use crate::ipp;
use crate::quirks::Quirks;
use crate::usb::UsbTransport;

static REQUEST_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Default)]
pub struct PrinterProbe {
    pub dns_sd_name: Option<String>,
    pub uuid: Option<String>,
    pub document_formats: Vec<String>,
    pub admin_url: Option<String>,
    pub icon_url: Option<String>,
    pub paper_sizes: Vec<String>,
    pub color_supported: bool,
    pub duplex_supported: bool,
    pub media_sources: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScannerProbe {
    pub color_modes: Vec<String>,
    pub document_formats: Vec<String>,
    pub platen_supported: bool,
    pub adf_supported: bool,
    pub duplex_supported: bool,
    pub version: Option<String>,
}

/// `POST /ipp/print` Get-Printer-Attributes. Never fails the caller: a
/// device that doesn't answer usefully just yields an empty probe, which
/// the device-instance layer falls back from.
pub async fn probe_ipp(transport: &UsbTransport, quirks: &Quirks, timeout: Duration) -> PrinterProbe {
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let body = ipp::get_printer_attributes_request(request_id);

    let request = Request::builder()
        .method("POST")
        .uri("http://localhost/ipp/print")
        .header(http::header::CONTENT_TYPE, "application/ipp")
        .body(hyper::Body::from(body))
        .expect("well-formed probe request");

    let cancel = CancellationToken::new();
    let Ok(response) = tokio::time::timeout(timeout, transport.round_trip(request, &cancel)).await else {
        return PrinterProbe::default();
    };
    let Ok(mut response) = response else {
        return PrinterProbe::default();
    };

    let Some(raw) = collect_body(response.body_mut()).await else {
        return PrinterProbe::default();
    };
    let Some(message) = ipp::decode_lenient(&raw) else {
        return PrinterProbe::default();
    };

    if !probe_status_accepted(message.status_or_operation, quirks.ignore_ipp_status) {
        return PrinterProbe::default();
    }

    PrinterProbe {
        dns_sd_name: message.attribute_text("printer-dns-sd-name").or_else(|| message.attribute_text("printer-name")),
        uuid: message.attribute_text("printer-uuid"),
        document_formats: message.attribute_text_values("document-format-supported"),
        admin_url: message.attribute_text("printer-more-info"),
        icon_url: message.attribute_text_values("printer-icons").into_iter().next(),
        paper_sizes: message.attribute_text_values("media-supported"),
        color_supported: message
            .attribute_text("color-supported")
            .is_some_and(|v| v == "true"),
        duplex_supported: message
            .attribute_text_values("sides-supported")
            .iter()
            .any(|v| v.contains("two-sided")),
        media_sources: message.attribute_text_values("media-source-supported"),
    }
}

/// `GET /eSCL/ScannerCapabilities`. Failure is non-fatal: scanning is
/// simply not advertised.
pub async fn probe_escl(transport: &UsbTransport, timeout: Duration) -> Option<ScannerProbe> {
    let request = Request::builder()
        .method("GET")
        .uri("http://localhost/eSCL/ScannerCapabilities")
        .body(hyper::Body::empty())
        .expect("well-formed probe request");

    let cancel = CancellationToken::new();
    let response = tokio::time::timeout(timeout, transport.round_trip(request, &cancel))
        .await
        .ok()?
        .ok()?;
    if !response.status().is_success() {
        return None;
    }

    let mut response = response;
    let xml = collect_body(response.body_mut()).await?;
    let xml = String::from_utf8_lossy(&xml);

    Some(ScannerProbe {
        color_modes: scan_xml_list(&xml, "ColorMode"),
        document_formats: scan_xml_list(&xml, "DocumentFormat"),
        platen_supported: xml.contains("<scan:Platen>") || xml.contains("<pwg:Platen"),
        adf_supported: xml.contains("Adf") || xml.contains("ADF"),
        duplex_supported: xml.contains("Duplex"),
        version: scan_xml_field(&xml, "Version"),
    })
}

/// IPP status codes below 0x0100 are the "successful-*" class (RFC 8011
/// §13.1.2); a device that answers with a client/server error status still
/// carries usable attributes on some firmware, which is exactly what
/// `ignore-ipp-status` is for.
fn probe_status_accepted(status: u16, ignore_ipp_status: bool) -> bool {
    status < 0x0100 || ignore_ipp_status
}

async fn collect_body(body: &mut hyper::Body) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        out.extend_from_slice(&chunk.ok()?);
    }
    Some(out)
}

/// First text content of `<prefix:Tag>...</prefix:Tag>` or `<Tag>...</Tag>`.
fn scan_xml_field(xml: &str, tag: &str) -> Option<String> {
    let open_needle = format!(">{tag}>");
    let start_tag_end = xml
        .match_indices(&open_needle)
        .find(|(idx, _)| xml[..*idx].ends_with(':') || xml.as_bytes().get(idx.wrapping_sub(1)) == Some(&b'<'))
        .map(|(idx, _)| idx + open_needle.len())?;
    let close_needle = format!("</");
    let rest = &xml[start_tag_end..];
    let end = rest.find(&close_needle)?;
    Some(rest[..end].trim().to_string())
}

fn scan_xml_list(xml: &str, tag: &str) -> Vec<String> {
    let needle = format!(">{tag}>");
    let mut values = Vec::new();
    let mut search_from = 0usize;
    while let Some(rel) = xml[search_from..].find(&needle) {
        let value_start = search_from + rel + needle.len();
        let Some(rel_end) = xml[value_start..].find("</") else { break };
        values.push(xml[value_start..value_start + rel_end].trim().to_string());
        search_from = value_start + rel_end;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_field_extraction_ignores_namespace_prefix() {
        let xml = "<scan:ScannerCapabilities><pwg:Version>2.63</pwg:Version></scan:ScannerCapabilities>";
        assert_eq!(scan_xml_field(xml, "Version"), Some("2.63".to_string()));
    }

    #[test]
    fn xml_list_collects_every_occurrence() {
        let xml = "<a><scan:ColorMode>RGB24</scan:ColorMode><scan:ColorMode>Grayscale8</scan:ColorMode></a>";
        assert_eq!(scan_xml_list(xml, "ColorMode"), vec!["RGB24".to_string(), "Grayscale8".to_string()]);
    }

    #[test]
    fn successful_status_always_accepted() {
        assert!(probe_status_accepted(0x0000, false));
        assert!(probe_status_accepted(0x0002, false));
    }

    #[test]
    fn error_status_rejected_unless_ignored() {
        assert!(!probe_status_accepted(0x0400, false));
        assert!(probe_status_accepted(0x0400, true));
    }
}
