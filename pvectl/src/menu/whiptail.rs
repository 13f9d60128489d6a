use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use super::Dialog;

const HEIGHT: &str = "20";
const WIDTH: &str = "76";
const LIST_HEIGHT: &str = "12";

/// Dialogs drawn by `whiptail`. The selection comes back on stderr.
pub struct Whiptail {
    /// Program and leading arguments.
    command: Vec<String>,
    backtitle: String,
}

impl Whiptail {
    pub fn new(backtitle: impl Into<String>) -> Self {
        Self {
            command: vec!["whiptail".to_string()],
            backtitle: backtitle.into(),
        }
    }

    #[cfg(test)]
    fn with_command(command: Vec<String>, backtitle: &str) -> Self {
        Self {
            command,
            backtitle: backtitle.to_owned(),
        }
    }

    /// `None` when the user pressed Cancel or Escape.
    fn run(&self, title: &str, args: Vec<String>) -> Result<Option<String>> {
        let output = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg("--backtitle")
            .arg(&self.backtitle)
            .arg("--title")
            .arg(title)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| "Failed to run whiptail")?;
        answer(output.status.code(), &output.stderr)
    }
}

fn answer(code: Option<i32>, stderr: &[u8]) -> Result<Option<String>> {
    let text = String::from_utf8_lossy(stderr).trim().to_owned();
    match code {
        Some(0) => Ok(Some(text)),
        Some(1) | Some(255) => Ok(None),
        code => bail!("whiptail exited with status {:?}: {}", code, text),
    }
}

impl Dialog for Whiptail {
    fn menu(&mut self, title: &str, text: &str, items: &[(String, String)]) -> Result<Option<String>> {
        let mut args = vec![
            "--menu".to_string(),
            text.to_owned(),
            HEIGHT.to_string(),
            WIDTH.to_string(),
            LIST_HEIGHT.to_string(),
        ];
        for (tag, item) in items {
            args.push(tag.to_owned());
            args.push(item.to_owned());
        }
        self.run(title, args)
    }

    fn input(&mut self, title: &str, text: &str, default: &str) -> Result<Option<String>> {
        self.run(
            title,
            vec![
                "--inputbox".to_string(),
                text.to_owned(),
                "10".to_string(),
                WIDTH.to_string(),
                default.to_owned(),
            ],
        )
    }

    fn yes_no(&mut self, title: &str, text: &str) -> Result<bool> {
        let answer = self.run(
            title,
            vec![
                "--yesno".to_string(),
                text.to_owned(),
                HEIGHT.to_string(),
                WIDTH.to_string(),
            ],
        )?;
        Ok(answer.is_some())
    }

    fn checklist(
        &mut self,
        title: &str,
        text: &str,
        items: &[(String, String, bool)],
    ) -> Result<Option<Vec<String>>> {
        let mut args = vec![
            "--separate-output".to_string(),
            "--checklist".to_string(),
            text.to_owned(),
            HEIGHT.to_string(),
            WIDTH.to_string(),
            LIST_HEIGHT.to_string(),
        ];
        for (tag, item, on) in items {
            args.push(tag.to_owned());
            args.push(item.to_owned());
            args.push(if *on { "ON" } else { "OFF" }.to_string());
        }
        Ok(self.run(title, args)?.map(|selected| {
            selected
                .lines()
                .map(|line| line.trim().trim_matches('"').to_owned())
                .filter(|tag| !tag.is_empty())
                .collect()
        }))
    }

    fn message(&mut self, title: &str, text: &str) -> Result<()> {
        self.run(
            title,
            vec![
                "--scrolltext".to_string(),
                "--msgbox".to_string(),
                text.to_owned(),
                HEIGHT.to_string(),
                WIDTH.to_string(),
            ],
        )?;
        Ok(())
    }
}
