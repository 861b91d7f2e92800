//! SSML documents for avatar speech.

/// Escape text for embedding in SSML.
pub fn encode_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// Voice used to speak replies, plus trailing silence per utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub voice: String,
    pub ending_silence_ms: u64,
}

impl VoiceProfile {
    pub fn new(voice: impl Into<String>) -> Self {
        Self { voice: voice.into(), ending_silence_ms: 0 }
    }

    pub fn with_ending_silence(mut self, ms: u64) -> Self {
        self.ending_silence_ms = ms;
        self
    }

    /// Wrap `text` in a speak document with zero leading silence.
    pub fn ssml(&self, text: &str) -> String {
        let mut ssml = format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' \
             xmlns:mstts='http://www.w3.org/2001/mstts' xml:lang='en-US'>\
             <voice name='{}'><mstts:ttsembedding>\
             <mstts:leadingsilence-exact value='0'/>{}\
             </mstts:ttsembedding></voice></speak>",
            self.voice,
            encode_text(text)
        );
        if self.ending_silence_ms > 0 {
            let tail = format!("<break time='{}ms'/></speak>", self.ending_silence_ms);
            ssml.truncate(ssml.len() - "</speak>".len());
            ssml.push_str(&tail);
        }
        ssml
    }
}
