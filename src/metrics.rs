//! Text exposition rendering (format version 0.0.4).

use crate::meter::Sample;

/// Content type the scrape endpoint answers with.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Render samples as `# HELP` / `# TYPE` / value lines. Every exported
/// reading is a gauge.
pub fn render(samples: &[Sample]) -> String {
    let mut out = String::new();
    for sample in samples {
        if let Some(help) = &sample.help {
            out.push_str("# HELP ");
            out.push_str(&sample.name);
            out.push(' ');
            out.push_str(&escape_help(help));
            out.push('\n');
        }
        out.push_str("# TYPE ");
        out.push_str(&sample.name);
        out.push_str(" gauge\n");
        out.push_str(&sample.name);
        out.push(' ');
        out.push_str(&sample.value.to_string());
        out.push('\n');
    }
    out
}

/// Backslashes and newlines must be escaped in HELP text.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_help() {
        let samples = vec![Sample {
            name: "echonet_instantaneous_power_watts".into(),
            value: 300,
            help: Some("Instantaneous electric power in watts.".into()),
        }];
        assert_eq!(
            render(&samples),
            "# HELP echonet_instantaneous_power_watts Instantaneous electric power in watts.\n\
             # TYPE echonet_instantaneous_power_watts gauge\n\
             echonet_instantaneous_power_watts 300\n"
        );
    }

    #[test]
    fn test_render_without_help() {
        let samples = vec![Sample {
            name: "echonet_current_r_deciamps".into(),
            value: -100,
            help: None,
        }];
        assert_eq!(
            render(&samples),
            "# TYPE echonet_current_r_deciamps gauge\nechonet_current_r_deciamps -100\n"
        );
    }

    #[test]
    fn test_render_escapes_help() {
        let samples = vec![Sample {
            name: "m".into(),
            value: 1,
            help: Some("line one\nline two".into()),
        }];
        assert!(render(&samples).contains("# HELP m line one\\nline two\n"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render(&[]), "");
    }
}
