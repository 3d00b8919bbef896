//! # Default Error Page
//!
//! Last stop of the fault chain when no exception handler claimed a fault.

use std::io::Write;

use crate::handlers::{Fault, HandlerResponse};

const STYLE: &str = "body { margin: 25pt; min-height: 70pt; min-width: 200pt; position: relative; } \
.err { font-size: 150%; } .code { font-weight: normal; font-size: 120%; } \
.tip { position: absolute; bottom: -10pt; opacity: 0.7; }";

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn write_page(response: &mut HandlerResponse, status: u16, message: Option<&str>) -> std::io::Result<()> {
    writeln!(
        response,
        "<html><head><title>Error {}</title><style>{}</style></head><body>",
        status, STYLE
    )?;
    write!(response, "<p class=\"err\">Error<span class=\"code\"> {}", status)?;
    match message {
        Some(message) => write!(response, ": </span>{}", escape(message))?,
        None => write!(response, "</span>")?,
    }
    writeln!(response, "</p>")?;
    writeln!(
        response,
        "<p class=\"tip\"><em>To change this message design, add an exception handler to your site</em></p>"
    )?;
    writeln!(response, "</body></html>")
}

/// Replace the response with the default page for `fault`
pub fn render(response: &mut HandlerResponse, fault: &Fault) {
    render_status(response, fault.status_code(), fault.message());
}

/// Replace the response with the default page for a status and message
pub fn render_status(response: &mut HandlerResponse, status: u16, message: Option<&str>) {
    response.reset();
    response.set_status(status);
    response.set_header("Content-Type", "text/html; charset=utf-8");
    if let Err(e) = write_page(response, status, message) {
        tracing::error!(status, "can't write the error page: {}", e);
    }
}
