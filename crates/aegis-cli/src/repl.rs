//! REPL – the interactive Aegis shell.
//!
//! Supported slash-commands:
//!   /help           – show this list
//!   /status         – safety state, session and capabilities
//!   /toggle         – manual toggle
//!   /escalate       – escalate an active session to emergency
//!   /volume N       – N volume-button presses
//!   /shake X        – a shake of intensity X
//!   /power N        – N power-button presses
//!   /taps N         – N screen taps
//!   /say TEXT       – speak TEXT to the keyword listener
//!   /grant CAP      – grant a capability (audio, location, camera, storage, sms)
//!   /revoke CAP     – revoke a capability
//!   /enroll WORD    – record, verify and save a voice keyword
//!   /quit | /exit   – stop monitoring and exit

use colored::{ColoredString, Colorize};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;

use aegis_middleware::sim::{SimCapabilityProvider, SimTranscriber};
use aegis_runtime::SafetyController;
use aegis_types::{
    Capability, CapabilityChange, GestureInput, SafetyError, SafetyState, Transcription,
};
use aegis_voice::{KeywordListener, VoiceEnrollment};

/// Length of the simulated take recorded by `/enroll`.
const ENROLL_TAKE: Duration = Duration::from_secs(2);

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Toggle,
    Escalate,
    Volume(u32),
    Shake(f32),
    Power(u32),
    Taps(usize),
    Say(String),
    Grant(Capability),
    Revoke(Capability),
    Enroll(String),
    Quit,
}

/// Parse one non-empty input line.  The error is the message to print.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };

    match name {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/toggle" => Ok(Command::Toggle),
        "/escalate" => Ok(Command::Escalate),
        "/volume" => number(name, arg).map(Command::Volume),
        "/shake" => number(name, arg).map(Command::Shake),
        "/power" => number(name, arg).map(Command::Power),
        "/taps" => number(name, arg).map(Command::Taps),
        "/say" if !arg.is_empty() => Ok(Command::Say(arg.to_string())),
        "/grant" => capability(name, arg).map(Command::Grant),
        "/revoke" => capability(name, arg).map(Command::Revoke),
        "/enroll" if !arg.is_empty() => Ok(Command::Enroll(arg.to_string())),
        "/say" | "/enroll" => Err(format!("{name} needs an argument")),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

fn number<T: std::str::FromStr>(name: &str, arg: &str) -> Result<T, String> {
    arg.parse()
        .map_err(|_| format!("{name} expects a number, got '{arg}'"))
}

fn capability(name: &str, arg: &str) -> Result<Capability, String> {
    Capability::parse(arg).ok_or_else(|| {
        format!("{name} expects one of audio, location, camera, storage, sms; got '{arg}'")
    })
}

/// Everything the shell drives.
pub struct Shell {
    pub controller: Arc<SafetyController>,
    pub provider: Arc<SimCapabilityProvider>,
    pub transcriber: Arc<SimTranscriber>,
    pub enrollment: VoiceEnrollment,
    pub listener: KeywordListener,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shell: &mut Shell, rt: &Runtime, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", prompt(shell.controller.state()));
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse(&line) {
            Ok(command) => command,
            Err(msg) => {
                println!("{}. Type {} for available commands.", msg.red(), "/help".bold());
                continue;
            }
        };

        match command {
            Command::Help => cmd_help(),
            Command::Status => cmd_status(shell),
            Command::Toggle => report(rt.block_on(shell.controller.toggle())),
            Command::Escalate => report(rt.block_on(shell.controller.escalate())),
            Command::Volume(count) => gesture(shell, rt, GestureInput::VolumeButtons { count }),
            Command::Shake(intensity) => gesture(shell, rt, GestureInput::Shake { intensity }),
            Command::Power(count) => gesture(shell, rt, GestureInput::PowerButton { count }),
            Command::Taps(n) => gesture(
                shell,
                rt,
                GestureInput::Taps {
                    taps: vec![Utc::now(); n],
                },
            ),
            Command::Say(text) => cmd_say(shell, rt, text),
            Command::Grant(cap) => cmd_grant(shell, rt, cap),
            Command::Revoke(cap) => cmd_revoke(shell, rt, cap),
            Command::Enroll(word) => cmd_enroll(shell, rt, &word),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Aegis Commands".bold().underline());
    let rows = [
        ("/status", "safety state, session and capabilities"),
        ("/toggle", "manual toggle"),
        ("/escalate", "escalate an active session to emergency"),
        ("/volume N", "press volume buttons N times"),
        ("/shake X", "shake the device with intensity X"),
        ("/power N", "press the power button N times"),
        ("/taps N", "tap the screen N times"),
        ("/say TEXT", "speak to the keyword listener"),
        ("/grant CAP", "grant audio, location, camera, storage or sms"),
        ("/revoke CAP", "revoke a capability"),
        ("/enroll WORD", "record, verify and save a voice keyword"),
        ("/quit  /exit", "stop monitoring and exit"),
    ];
    for (cmd, what) in rows {
        println!("  {:<14} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn cmd_status(shell: &Shell) {
    let controller = &shell.controller;
    let gate = controller.capability_gate();

    println!("{}", "Status".bold().underline());
    println!("  State        : {}", paint(controller.state()));
    match controller.session() {
        Some(session) => {
            println!("  Session      : {}", session.session_id.bold());
            println!("  Trigger      : {}", session.trigger_method);
            println!(
                "  Started      : {}",
                session.start_time.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(at) = session.emergency_time {
                println!("  Emergency at : {}", at.format("%H:%M:%S UTC").to_string().red());
            }
            if session.evidence_counts.is_empty() {
                println!("  Evidence     : {}", "none yet".dimmed());
            } else {
                for (category, count) in &session.evidence_counts {
                    println!("  Evidence     : {} × {}", count, category.as_str());
                }
            }
        }
        None => println!("  Session      : {}", "none".dimmed()),
    }
    println!("  Active       : {}", list(&gate.active_labels()).green());
    println!("  Missing      : {}", list(&gate.missing_labels()).yellow());
    println!(
        "  Voice trigger: {}",
        if shell.listener.is_armed() {
            "armed".green()
        } else {
            "not enrolled".dimmed()
        }
    );
}

fn gesture(shell: &Shell, rt: &Runtime, input: GestureInput) {
    match rt.block_on(shell.controller.handle_input(input)) {
        Ok(Some(state)) => println!("  state: {}", paint(state)),
        Ok(None) => println!("  {}", "No trigger (below threshold or already protected).".dimmed()),
        Err(e) => report(Err(e)),
    }
}

fn cmd_say(shell: &Shell, rt: &Runtime, text: String) {
    let heard = shell.listener.hear(&Transcription {
        text,
        alternative_texts: Vec::new(),
    });
    match heard {
        Some(input) => gesture(shell, rt, input),
        None => println!(
            "  {} Enroll one with {}.",
            "No voice keyword is armed.".yellow(),
            "/enroll WORD".bold()
        ),
    }
}

fn cmd_grant(shell: &Shell, rt: &Runtime, cap: Capability) {
    match rt.block_on(shell.controller.request_capability(cap)) {
        Ok(true) => println!("  {} {} granted", "✓".green(), cap.label().bold()),
        Ok(false) => println!("  {} {} denied", "✗".red(), cap.label().bold()),
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_revoke(shell: &Shell, rt: &Runtime, cap: Capability) {
    shell.provider.set(cap, false);
    rt.block_on(shell.controller.apply_capability_change(CapabilityChange {
        capability: cap,
        granted: false,
    }));
    println!("  {} revoked", cap.label().bold());
}

fn cmd_enroll(shell: &mut Shell, rt: &Runtime, word: &str) {
    if let Err(e) = shell.enrollment.set_keyword(word) {
        println!("{}: {}", "Invalid keyword".red(), e);
        return;
    }
    // The simulated microphone hears the keyword spoken clearly.
    shell.transcriber.set_transcription(word.to_lowercase(), Vec::new());

    println!("  Recording {:.1}s sample …", ENROLL_TAKE.as_secs_f32());
    let enrollment = &mut shell.enrollment;
    let outcome = rt.block_on(async {
        enrollment.record_until(tokio::time::sleep(ENROLL_TAKE)).await?;
        let verdict = enrollment.verify().await?;
        println!(
            "  Heard \"{}\" → {:?} ({:.2})",
            verdict.transcribed_text, verdict.match_type, verdict.confidence
        );
        if !verdict.is_match() {
            enrollment.accept_unverified()?;
            println!("  {}", "Sample did not verify; saving anyway.".yellow());
        }
        enrollment.save().await
    });

    match outcome {
        Ok(record) => {
            shell.listener.arm(&record);
            println!(
                "  {} Keyword {} enrolled ({})",
                "✓".green().bold(),
                record.keyword.bold(),
                record.sample_url.dimmed()
            );
        }
        Err(e) => {
            println!("{}: {}", "Enrollment failed".red(), e);
            rt.block_on(shell.enrollment.discard());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn report(result: Result<SafetyState, SafetyError>) {
    match result {
        Ok(state) => println!("  state: {}", paint(state)),
        Err(SafetyError::CapabilityMissing(cap)) => println!(
            "  {} {} is required. Try {}",
            "Blocked:".red().bold(),
            cap.label(),
            format!("/grant {cap}").bold()
        ),
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn paint(state: SafetyState) -> ColoredString {
    match state {
        SafetyState::Disabled => state.as_str().dimmed(),
        SafetyState::Active => state.as_str().green().bold(),
        SafetyState::Emergency => state.as_str().red().bold(),
    }
}

fn prompt(state: SafetyState) -> ColoredString {
    match state {
        SafetyState::Disabled => "aegis>".bold().cyan(),
        SafetyState::Active => "aegis[active]>".bold().green(),
        SafetyState::Emergency => "aegis[EMERGENCY]>".bold().red(),
    }
}

fn list(labels: &[String]) -> String {
    if labels.is_empty() {
        "–".to_string()
    } else {
        labels.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse("/help"), Ok(Command::Help));
        assert_eq!(parse("  /status  "), Ok(Command::Status));
        assert_eq!(parse("/toggle"), Ok(Command::Toggle));
        assert_eq!(parse("/escalate"), Ok(Command::Escalate));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
    }

    #[test]
    fn parses_numeric_arguments() {
        assert_eq!(parse("/volume 3"), Ok(Command::Volume(3)));
        assert_eq!(parse("/shake 18.5"), Ok(Command::Shake(18.5)));
        assert_eq!(parse("/power  5"), Ok(Command::Power(5)));
        assert_eq!(parse("/taps 9"), Ok(Command::Taps(9)));
        assert!(parse("/volume").is_err());
        assert!(parse("/taps many").is_err());
    }

    #[test]
    fn parses_capabilities() {
        assert_eq!(parse("/grant audio"), Ok(Command::Grant(Capability::Audio)));
        assert_eq!(parse("/revoke SMS"), Ok(Command::Revoke(Capability::Sms)));
        assert!(parse("/grant microphone").is_err());
    }

    #[test]
    fn keeps_free_text_arguments() {
        assert_eq!(
            parse("/say hey phoenix now"),
            Ok(Command::Say("hey phoenix now".into()))
        );
        assert_eq!(parse("/enroll Phoenix"), Ok(Command::Enroll("Phoenix".into())));
        assert!(parse("/enroll").is_err());
        assert!(parse("/say   ").is_err());
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = parse("/launch").unwrap_err();
        assert!(err.contains("/launch"));
    }
}
