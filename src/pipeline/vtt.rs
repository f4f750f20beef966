//! WebVTT reading and subtitle rendering.

/// One subtitle cue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    /// Timing line as written in the VTT, e.g. `00:01.000 --> 00:04.500`
    pub timing: String,
    pub text: String,
}

/// Text and timings pulled out of a VTT document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VttTranscript {
    pub cues: Vec<Cue>,
}

impl VttTranscript {
    /// Parse a VTT document; multi-line cue text is joined with spaces
    pub fn parse(vtt: &str) -> Self {
        let mut cues = Vec::new();
        let mut lines = vtt.lines().map(str::trim).peekable();

        while let Some(line) = lines.next() {
            if !line.contains("-->") {
                continue;
            }

            let mut text = Vec::new();
            while let Some(next) = lines.peek() {
                if next.is_empty() || next.contains("-->") {
                    break;
                }
                text.push(*next);
                lines.next();
            }

            cues.push(Cue {
                timing: line.to_string(),
                text: text.join(" "),
            });
        }

        Self { cues }
    }

    /// Cue text, one line per cue
    pub fn stripped_text(&self) -> String {
        self.cues
            .iter()
            .map(|cue| cue.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn timestamps(&self) -> Vec<String> {
        self.cues.iter().map(|cue| cue.timing.clone()).collect()
    }

    /// Same timings carrying new text, one line per cue
    ///
    /// Returns `None` when the line count does not match the cue count.
    pub fn with_text(&self, text: &str) -> Option<Self> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() != self.cues.len() {
            return None;
        }

        let cues = self
            .cues
            .iter()
            .zip(lines)
            .map(|(cue, line)| Cue {
                timing: cue.timing.clone(),
                text: line.trim().to_string(),
            })
            .collect();
        Some(Self { cues })
    }

    pub fn to_vtt(&self) -> String {
        let mut out = String::from("WEBVTT\n\n");
        for cue in &self.cues {
            out.push_str(&format!("{}\n{}\n\n", cue.timing, cue.text));
        }
        out
    }

    pub fn to_srt(&self) -> String {
        let mut out = String::new();
        for (index, cue) in self.cues.iter().enumerate() {
            out.push_str(&format!("{}\n{}\n{}\n\n", index + 1, srt_timing(&cue.timing), cue.text));
        }
        out
    }

    pub fn to_txt(&self) -> String {
        let mut out = self.stripped_text();
        out.push('\n');
        out
    }
}

/// `00:01.000 --> 00:04.500` becomes `00:00:01,000 --> 00:00:04,500`
fn srt_timing(timing: &str) -> String {
    timing
        .split("-->")
        .map(|stamp| srt_timestamp(stamp.trim()))
        .collect::<Vec<_>>()
        .join(" --> ")
}

fn srt_timestamp(stamp: &str) -> String {
    // Cue settings may follow the end timestamp
    let stamp = stamp.split_whitespace().next().unwrap_or_default();
    let stamp = if stamp.matches(':').count() == 1 {
        format!("00:{}", stamp)
    } else {
        stamp.to_string()
    };
    stamp.replace('.', ",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT

00:00.000 --> 00:02.500
Bonjour tout le monde.

00:02.500 --> 00:05.000
Ceci est un test
sur deux lignes.

01:00:05.000 --> 01:00:07.000 align:start
Fin.
";

    #[test]
    fn test_parse_extracts_text_and_timestamps() {
        let transcript = VttTranscript::parse(SAMPLE);
        assert_eq!(transcript.cues.len(), 3);
        assert_eq!(
            transcript.stripped_text(),
            "Bonjour tout le monde.\nCeci est un test sur deux lignes.\nFin."
        );
        assert_eq!(transcript.timestamps()[0], "00:00.000 --> 00:02.500");
    }

    #[test]
    fn test_srt_rendering() {
        let srt = VttTranscript::parse(SAMPLE).to_srt();
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:02,500\nBonjour tout le monde.\n\n"));
        assert!(srt.contains("3\n01:00:05,000 --> 01:00:07,000\nFin.\n"));
    }

    #[test]
    fn test_with_text_keeps_timings() {
        let transcript = VttTranscript::parse(SAMPLE);
        let translated = transcript
            .with_text("Hello everyone.\nThis is a test on two lines.\nEnd.")
            .unwrap();
        assert_eq!(translated.timestamps(), transcript.timestamps());
        assert!(translated
            .to_vtt()
            .starts_with("WEBVTT\n\n00:00.000 --> 00:02.500\nHello everyone.\n"));
        assert_eq!(translated.to_txt(), "Hello everyone.\nThis is a test on two lines.\nEnd.\n");

        assert!(transcript.with_text("only one line").is_none());
    }

    #[test]
    fn test_empty_document() {
        let transcript = VttTranscript::parse("WEBVTT\n\n");
        assert!(transcript.cues.is_empty());
        assert_eq!(transcript.stripped_text(), "");
    }
}
