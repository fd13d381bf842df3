//! Prebuilt voices offered by the live speech service.
//!
//! Names are matched case-insensitively; the canonical spelling is what goes on
//! the wire.

/// Metadata shown to the user for a prebuilt voice.
#[derive(Debug, Clone, Copy)]
pub struct Voice {
    pub name: &'static str,
    pub style: &'static str,
}

/// Sorted by name for binary search.
const VOICES: &[Voice] = &[
    Voice { name: "Achernar", style: "Soft" },
    Voice { name: "Achird", style: "Friendly" },
    Voice { name: "Algenib", style: "Gravelly" },
    Voice { name: "Algieba", style: "Smooth" },
    Voice { name: "Alnilam", style: "Firm" },
    Voice { name: "Aoede", style: "Breezy" },
    Voice { name: "Autonoe", style: "Bright" },
    Voice { name: "Callirrhoe", style: "Easy-going" },
    Voice { name: "Charon", style: "Informative" },
    Voice { name: "Despina", style: "Smooth" },
    Voice { name: "Enceladus", style: "Breathy" },
    Voice { name: "Erinome", style: "Clear" },
    Voice { name: "Fenrir", style: "Excitable" },
    Voice { name: "Gacrux", style: "Mature" },
    Voice { name: "Iapetus", style: "Clear" },
    Voice { name: "Kore", style: "Firm" },
    Voice { name: "Laomedeia", style: "Upbeat" },
    Voice { name: "Leda", style: "Youthful" },
    Voice { name: "Orus", style: "Firm" },
    Voice { name: "Puck", style: "Upbeat" },
    Voice { name: "Pulcherrima", style: "Forward" },
    Voice { name: "Rasalgethi", style: "Informative" },
    Voice { name: "Sadachbia", style: "Lively" },
    Voice { name: "Sadaltager", style: "Knowledgeable" },
    Voice { name: "Schedar", style: "Even" },
    Voice { name: "Sulafat", style: "Warm" },
    Voice { name: "Umbriel", style: "Easy-going" },
    Voice { name: "Vindemiatrix", style: "Gentle" },
    Voice { name: "Zephyr", style: "Bright" },
    Voice { name: "Zubenelgenubi", style: "Casual" },
];

pub const DEFAULT_VOICE: &str = "Kore";

/// Look up a voice by name, ignoring case.
pub fn get_voice(name: &str) -> Option<&'static Voice> {
    let needle = name.trim().to_ascii_lowercase();
    VOICES
        .binary_search_by(|voice| voice.name.to_ascii_lowercase().cmp(&needle))
        .ok()
        .map(|idx| &VOICES[idx])
}

pub fn print_voices() {
    println!("Prebuilt voices ({}):", VOICES.len());
    println!("{:<15} STYLE", "VOICE");
    println!("{}", "─".repeat(32));
    for voice in VOICES {
        let marker = if voice.name == DEFAULT_VOICE { " (default)" } else { "" };
        println!("{:<15} {}{}", voice.name, voice.style, marker);
    }
    println!();
    println!("Usage: live-voice-assistant --voice Puck");
}

pub fn print_voice_info(name: &str) -> anyhow::Result<()> {
    let voice = get_voice(name).ok_or_else(|| anyhow::anyhow!("Voice '{}' not found. Run with --list-voices to see available voices", name))?;

    println!();
    println!("Voice: {}", voice.name);
    println!("{}", "─".repeat(32));
    println!("Style: {}", voice.style);
    println!();
    println!("Usage: live-voice-assistant --voice {}", voice.name);
    println!();

    Ok(())
}
