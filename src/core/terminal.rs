use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_banner() {
    println!();
    println!("{}{}", SPARKLE, style("ops-office").bold().cyan());
    println!("{}\n", style("Six agents, one closed loop.").dim());
}

enum Line {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

/// A titled block of help or result output.
pub struct GuideSection {
    title: String,
    lines: Vec<Line>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(Line::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(Line::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(Line::Text(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(Line::Blank);
        self
    }

    pub fn print(self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .lines
            .iter()
            .filter_map(|l| match l {
                Line::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for line in self.lines {
            match line {
                Line::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                Line::Status(label, value) => {
                    println!("   {} {}: {}", GEAR, style(label).bold().cyan(), value)
                }
                Line::Text(text) => {
                    for part in text.lines() {
                        println!("   {}", part);
                    }
                }
                Line::Blank => println!(),
            }
        }
    }
}
