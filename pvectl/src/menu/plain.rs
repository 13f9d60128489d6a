use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use anyhow::{Context, Result};

use super::Dialog;

/// Answer that leaves a prompt without choosing anything.
const BACK: &str = "<";

/// Numbered prompts on plain stdin/stdout, for hosts without whiptail.
///
/// End of input cancels like `<` does.
pub struct PlainPrompt<R, W> {
    input: R,
    output: W,
}

impl PlainPrompt<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> PlainPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
        }
    }

    fn prompt(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .with_context(|| "Failed to read answer")?;
        let line = line.trim();
        if read == 0 || line == BACK {
            return Ok(None);
        }
        Ok(Some(line.to_owned()))
    }

    fn header(&mut self, title: &str, text: &str) -> Result<()> {
        writeln!(self.output, "\n== {} ==", title)?;
        if !text.is_empty() {
            writeln!(self.output, "{}", text)?;
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> Dialog for PlainPrompt<R, W> {
    fn menu(&mut self, title: &str, text: &str, items: &[(String, String)]) -> Result<Option<String>> {
        self.header(title, text)?;
        for (index, (_, item)) in items.iter().enumerate() {
            writeln!(self.output, "  {:>2}) {}", index + 1, item)?;
        }
        loop {
            let answer = match self.prompt(&format!("Choice [1-{}, {} to go back]: ", items.len(), BACK))? {
                Some(answer) => answer,
                None => return Ok(None),
            };
            match answer.parse::<usize>() {
                Ok(n) if (1..=items.len()).contains(&n) => return Ok(Some(items[n - 1].0.to_owned())),
                _ => writeln!(self.output, "Invalid choice '{}'", answer)?,
            }
        }
    }

    fn input(&mut self, title: &str, text: &str, default: &str) -> Result<Option<String>> {
        self.header(title, "")?;
        let answer = self.prompt(&format!("{} [{}]: ", text, default))?;
        Ok(answer.map(|answer| {
            if answer.is_empty() {
                default.to_owned()
            } else {
                answer
            }
        }))
    }

    fn yes_no(&mut self, title: &str, text: &str) -> Result<bool> {
        self.header(title, text)?;
        let answer = self.prompt("Continue? [y/N]: ")?;
        Ok(matches!(
            answer.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("y" | "yes")
        ))
    }

    fn checklist(
        &mut self,
        title: &str,
        text: &str,
        items: &[(String, String, bool)],
    ) -> Result<Option<Vec<String>>> {
        self.header(title, text)?;
        for (index, (_, item, on)) in items.iter().enumerate() {
            let mark = if *on { 'x' } else { ' ' };
            writeln!(self.output, "  {:>2}) [{}] {}", index + 1, mark, item)?;
        }
        loop {
            let answer = match self.prompt("Numbers separated by spaces [keep marked]: ")? {
                Some(answer) => answer,
                None => return Ok(None),
            };
            if answer.is_empty() {
                return Ok(Some(
                    items
                        .iter()
                        .filter(|(_, _, on)| *on)
                        .map(|(tag, _, _)| tag.to_owned())
                        .collect(),
                ));
            }
            let picked = answer
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<usize>()
                        .ok()
                        .filter(|n| (1..=items.len()).contains(n))
                        .map(|n| items[n - 1].0.to_owned())
                })
                .collect::<Option<Vec<_>>>();
            match picked {
                Some(tags) => return Ok(Some(tags)),
                None => writeln!(self.output, "Invalid selection '{}'", answer)?,
            }
        }
    }

    fn message(&mut self, title: &str, text: &str) -> Result<()> {
        self.header(title, text)?;
        Ok(())
    }
}
