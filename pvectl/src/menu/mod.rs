//! Interactive menu started when no template parameters are given.

use std::path::PathBuf;

use anyhow::{bail, Result};
use provisioner::Workload;
use resources::{
    config::BatchQueue,
    objects::{
        template::{parse_disk_size, validate_name, validate_vmid},
        OsFamily, TemplateConfig,
    },
    utils::split_list,
};
use rpve::{deps, proxmox};
use strum::IntoEnumIterator;

use crate::{app::App, batch};

mod plain;
mod whiptail;

pub use plain::PlainPrompt;
pub use whiptail::Whiptail;

const TITLE: &str = "Proxmox template toolkit";

const COMMON_PACKAGES: [&str; 8] = [
    "curl", "wget", "vim", "htop", "git", "jq", "tmux", "unzip",
];

/// Cancelled prompts return `None`.
pub trait Dialog {
    /// Pick one item, returning its tag.
    fn menu(&mut self, title: &str, text: &str, items: &[(String, String)]) -> Result<Option<String>>;

    fn input(&mut self, title: &str, text: &str, default: &str) -> Result<Option<String>>;

    /// `false` for both "no" and cancel.
    fn yes_no(&mut self, title: &str, text: &str) -> Result<bool>;

    /// Pick any number of `(tag, item, preselected)` items.
    fn checklist(
        &mut self,
        title: &str,
        text: &str,
        items: &[(String, String, bool)],
    ) -> Result<Option<Vec<String>>>;

    fn message(&mut self, title: &str, text: &str) -> Result<()>;
}

/// Whiptail when installed, plain prompts otherwise.
pub fn default_dialog() -> Box<dyn Dialog> {
    if deps::find_in_path("whiptail").is_some() {
        Box::new(Whiptail::new(TITLE))
    } else {
        tracing::debug!("whiptail not found, using plain prompts");
        Box::new(PlainPrompt::stdio())
    }
}

/// Leave the current flow when a prompt was cancelled.
macro_rules! or_back {
    ($answer:expr) => {
        match $answer {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkloadKind {
    Docker,
    Kubernetes,
}

pub struct Menu<'a> {
    app: &'a App,
    dialog: &'a mut dyn Dialog,
    /// Defaults for new templates.
    base: TemplateConfig,
}

impl<'a> Menu<'a> {
    pub fn new(app: &'a App, dialog: &'a mut dyn Dialog, base: TemplateConfig) -> Self {
        Self {
            app,
            dialog,
            base,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let items = items(&[
            ("create", "Create a VM template"),
            ("batch", "Create templates from a batch file"),
            ("docker", "Provision a Docker workload"),
            ("kubernetes", "Provision a Kubernetes workload"),
            ("terraform", "Generate a Terraform module"),
            ("ansible", "Generate an Ansible inventory"),
            ("list", "List distributions"),
            ("exit", "Exit"),
        ]);
        loop {
            let choice = self.dialog.menu(TITLE, "Choose an action", &items)?;
            let result = match choice.as_deref() {
                None | Some("exit") => return Ok(()),
                Some("create") => self.create().await,
                Some("batch") => self.batch().await,
                Some("docker") => self.workload(WorkloadKind::Docker).await,
                Some("kubernetes") => self.workload(WorkloadKind::Kubernetes).await,
                Some("terraform") => self.terraform().await,
                Some("ansible") => self.ansible().await,
                Some("list") => self.list().map(Some),
                Some(other) => {
                    tracing::warn!("Unknown menu entry {}", other);
                    Ok(None)
                },
            };
            match result {
                Ok(Some((title, text))) => self.dialog.message(&title, &text)?,
                Ok(None) => {},
                Err(err) => {
                    tracing::error!("{:#}", err);
                    self.dialog.message("Error", &format!("{:#}", err))?;
                },
            }
        }
    }

    async fn create(&mut self) -> Result<Option<(String, String)>> {
        let config = or_back!(self.ask_template().await?);
        let created = self.app.create(&config).await?;
        Ok(Some(("Template created".to_string(), created.to_string())))
    }

    async fn ask_template(&mut self) -> Result<Option<TemplateConfig>> {
        let registry = self.app.registry();
        let families = OsFamily::iter()
            .map(|family| (family, registry.by_family(family).count()))
            .filter(|(_, count)| *count > 0)
            .map(|(family, count)| (family.to_string(), format!("{} ({} distributions)", family, count)))
            .collect::<Vec<_>>();
        let family = or_back!(self.dialog.menu("Distribution", "Choose a family", &families)?);
        let family = family.parse::<OsFamily>()?;
        let distributions = registry
            .by_family(family)
            .map(|d| (d.key.to_owned(), d.name.to_owned()))
            .collect::<Vec<_>>();
        let key = or_back!(self.dialog.menu("Distribution", "Choose a distribution", &distributions)?);

        let mut config = self.base.clone();
        config.template_name = or_back!(self.ask_valid(
            "Template name",
            "Name of the template VM",
            &format!("{}-template", key),
            |name| validate_name(name).map(|_| name.to_owned()),
        )?);
        config.distribution = key;
        config.vmid = or_back!(self.ask_valid("VMID", "VMID, or auto for the next free one", "auto", |value| {
            match value {
                "" | "auto" => Ok(None),
                _ => {
                    let vmid = value.parse::<u32>()?;
                    validate_vmid(vmid)?;
                    Ok(Some(vmid))
                },
            }
        })?);
        config.cores = or_back!(self.ask_valid("Resources", "CPU cores", &config.cores.to_string(), |value| {
            Ok(value.parse::<u32>()?)
        })?);
        config.memory = or_back!(self.ask_valid("Resources", "Memory in MiB", &config.memory.to_string(), |value| {
            Ok(value.parse::<u32>()?)
        })?);
        config.disk_size = or_back!(self.ask_valid("Resources", "Disk size", &config.disk_size.clone(), |value| {
            parse_disk_size(value).map(|_| value.to_owned())
        })?);
        config.storage = or_back!(self.ask_storage(&config.storage).await?);

        let packages = COMMON_PACKAGES
            .iter()
            .map(|p| (p.to_string(), p.to_string(), config.packages.iter().any(|c| c.as_str() == *p)))
            .collect::<Vec<_>>();
        let mut selected = or_back!(self.dialog.checklist("Packages", "Packages baked into the image", &packages)?);
        let extra = or_back!(self.dialog.input("Packages", "Additional packages", "")?);
        selected.extend(split_list(&extra));
        config.packages = selected;

        if let Err(err) = config.validate() {
            self.dialog.message("Invalid configuration", &format!("{:#}", err))?;
            return Ok(None);
        }
        let summary = format!("{}\nCreate this template?", config);
        if !self.dialog.yes_no("Confirm", &summary)? {
            return Ok(None);
        }
        Ok(Some(config))
    }

    /// Ask until `parse` accepts the answer.
    fn ask_valid<T>(
        &mut self,
        title: &str,
        text: &str,
        default: &str,
        parse: impl Fn(&str) -> Result<T>,
    ) -> Result<Option<T>> {
        loop {
            let answer = or_back!(self.dialog.input(title, text, default)?);
            match parse(answer.trim()) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => self.dialog.message("Invalid value", &format!("{:#}", err))?,
            }
        }
    }

    async fn ask_storage(&mut self, default: &str) -> Result<Option<String>> {
        let storages = proxmox::list_storage(self.app.runner(), "images").await?;
        if storages.is_empty() {
            return self.dialog.input("Storage", "Storage for the boot disk", default);
        }
        let items = storages
            .iter()
            .filter(|s| s.active)
            .map(|s| (s.name.to_owned(), s.to_string()))
            .collect::<Vec<_>>();
        if items.is_empty() {
            let names = storages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
            bail!(
                "No active storage can hold disk images, inactive: {}",
                names.join(", ")
            );
        }
        self.dialog.menu("Storage", "Storage for the boot disk", &items)
    }

    async fn batch(&mut self) -> Result<Option<(String, String)>> {
        let path = or_back!(self.dialog.input("Batch", "Batch queue file", "templates.batch")?);
        let queue = BatchQueue::load(&PathBuf::from(path))?;
        let summary = batch::run(self.app, &queue, &self.base).await;
        Ok(Some(("Batch".to_string(), summary.to_string())))
    }

    async fn workload(&mut self, kind: WorkloadKind) -> Result<Option<(String, String)>> {
        let catalog = self.app.catalog();
        let templates = match kind {
            WorkloadKind::Docker => catalog
                .docker_templates()
                .map(|t| (t.name.to_owned(), t.description.to_owned()))
                .collect::<Vec<_>>(),
            WorkloadKind::Kubernetes => catalog
                .kubernetes_templates()
                .map(|t| (t.name.to_owned(), t.description.to_owned()))
                .collect(),
        };
        let name = or_back!(self.dialog.menu("Workload", "Choose a workload template", &templates)?);
        let workload = match kind {
            WorkloadKind::Docker => Workload::Docker(catalog.docker(&name)?),
            WorkloadKind::Kubernetes => Workload::Kubernetes(catalog.kubernetes(&name)?),
        };
        let report = self.app.provision(&workload).await?;
        Ok(Some(("Workload provisioned".to_string(), report.to_string())))
    }

    async fn terraform(&mut self) -> Result<Option<(String, String)>> {
        let mut config = self.base.clone();
        config.template_name = or_back!(self.ask_valid("Terraform", "Template to clone", "", |name| {
            validate_name(name).map(|_| name.to_owned())
        })?);
        let vmid = or_back!(self.ask_valid("Terraform", "VMID of the template", "", |value| {
            let vmid = value.parse::<u32>()?;
            validate_vmid(vmid)?;
            Ok(vmid)
        })?);
        let module = or_back!(self.dialog.input("Terraform", "Module name", &config.template_name)?);
        config.terraform_module = Some(module);
        let dir = self.app.terraform(&config, vmid).await?;
        Ok(Some((
            "Terraform".to_string(),
            format!("Module written to {}", dir.display()),
        )))
    }

    async fn ansible(&mut self) -> Result<Option<(String, String)>> {
        let mut config = self.base.clone();
        config.template_name = or_back!(self.ask_valid("Ansible", "Template whose clones are configured", "", |name| {
            validate_name(name).map(|_| name.to_owned())
        })?);
        let user = or_back!(self.dialog.input("Ansible", "SSH user of the clones", "root")?);
        config.ansible_playbook = None;
        let files = self.app.ansible(&config, &user).await?;
        Ok(Some((
            "Ansible".to_string(),
            format!(
                "Inventory: {}\nPlaybook:  {}",
                files.inventory.display(),
                files.playbook.display()
            ),
        )))
    }

    fn list(&self) -> Result<(String, String)> {
        Ok(("Distributions".to_string(), self.app.distribution_table()))
    }
}

fn items(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(tag, item)| (tag.to_string(), item.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Arc};

    use rpve::{DryRunRunner, Output, RecordingRunner};

    use super::*;
    use crate::app::{tests, Options};

    #[derive(Debug)]
    enum Answer {
        Choice(Option<&'static str>),
        Text(Option<&'static str>),
        Yes(bool),
        Checks(Option<Vec<&'static str>>),
    }

    /// Replays scripted answers and records every message shown.
    #[derive(Default)]
    struct Scripted {
        answers: VecDeque<Answer>,
        messages: Vec<(String, String)>,
    }

    impl Scripted {
        fn new(answers: Vec<Answer>) -> Self {
            Self {
                answers: answers.into(),
                messages: vec![],
            }
        }

        fn next(&mut self) -> Answer {
            self.answers.pop_front().expect("script ran out of answers")
        }
    }

    impl Dialog for Scripted {
        fn menu(&mut self, _: &str, _: &str, items: &[(String, String)]) -> Result<Option<String>> {
            match self.next() {
                Answer::Choice(choice) => {
                    if let Some(tag) = choice {
                        assert!(items.iter().any(|(t, _)| t == tag), "{} not offered", tag);
                    }
                    Ok(choice.map(str::to_owned))
                },
                other => panic!("expected a menu answer, got {:?}", other),
            }
        }

        fn input(&mut self, _: &str, _: &str, default: &str) -> Result<Option<String>> {
            match self.next() {
                Answer::Text(text) => Ok(text.map(|t| if t.is_empty() { default } else { t }.to_owned())),
                other => panic!("expected an input answer, got {:?}", other),
            }
        }

        fn yes_no(&mut self, _: &str, _: &str) -> Result<bool> {
            match self.next() {
                Answer::Yes(yes) => Ok(yes),
                other => panic!("expected a yes/no answer, got {:?}", other),
            }
        }

        fn checklist(&mut self, _: &str, _: &str, _: &[(String, String, bool)]) -> Result<Option<Vec<String>>> {
            match self.next() {
                Answer::Checks(checks) => {
                    Ok(checks.map(|c| c.into_iter().map(str::to_owned).collect()))
                },
                other => panic!("expected a checklist answer, got {:?}", other),
            }
        }

        fn message(&mut self, title: &str, text: &str) -> Result<()> {
            self.messages.push((title.to_owned(), text.to_owned()));
            Ok(())
        }
    }

    fn app(dir: &std::path::Path) -> App {
        tests::app(
            tests::settings(dir),
            Arc::new(DryRunRunner),
            Options {
                dry_run: true,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn create_flow_builds_a_template() {
        use Answer::*;

        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut dialog = Scripted::new(vec![
            Choice(Some("create")),
            Choice(Some("debian")),
            Choice(Some("debian-12")),
            Text(Some("bad_name")),
            Text(Some("debian-base")),
            Text(Some("")),
            Text(Some("4")),
            Text(Some("")),
            Text(Some("32G")),
            Text(Some("")),
            Checks(Some(vec!["curl", "vim"])),
            Text(Some("nfs-common")),
            Yes(true),
            Choice(Some("exit")),
        ]);

        Menu::new(&app, &mut dialog, TemplateConfig::default())
            .run()
            .await
            .unwrap();
        assert!(dialog.answers.is_empty());
        let titles = dialog
            .messages
            .iter()
            .map(|(title, _)| title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Invalid value", "Template created"]);
        assert!(dialog.messages[1].1.contains("debian-base (VMID 9000"));
    }

    #[tokio::test]
    async fn cancel_returns_to_main_menu() {
        use Answer::*;

        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut dialog = Scripted::new(vec![
            Choice(Some("create")),
            Choice(Some("alpine")),
            Choice(None),
            Choice(Some("create")),
            Choice(Some("debian")),
            Choice(Some("debian-12")),
            Text(Some("")),
            Text(None),
            Choice(Some("list")),
            Choice(None),
        ]);

        Menu::new(&app, &mut dialog, TemplateConfig::default())
            .run()
            .await
            .unwrap();
        assert!(dialog.answers.is_empty());
        assert_eq!(dialog.messages.len(), 1);
        assert_eq!(dialog.messages[0].0, "Distributions");
    }

    #[tokio::test]
    async fn declined_confirmation_builds_nothing() {
        use Answer::*;

        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut dialog = Scripted::new(vec![
            Choice(Some("create")),
            Choice(Some("redhat")),
            Choice(Some("rocky-9")),
            Text(Some("")),
            Text(Some("")),
            Text(Some("")),
            Text(Some("")),
            Text(Some("")),
            Text(Some("")),
            Checks(Some(vec![])),
            Text(Some("")),
            Yes(false),
            Choice(Some("exit")),
        ]);

        Menu::new(&app, &mut dialog, TemplateConfig::default())
            .run()
            .await
            .unwrap();
        assert!(dialog.messages.is_empty());
    }

    #[tokio::test]
    async fn errors_are_shown_and_the_menu_continues() {
        use Answer::*;

        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut dialog = Scripted::new(vec![
            Choice(Some("batch")),
            Text(Some("/nonexistent/templates.batch")),
            Choice(Some("terraform")),
            Text(Some("debian-base")),
            Text(Some("9000")),
            Text(Some("")),
            Choice(Some("exit")),
        ]);

        Menu::new(&app, &mut dialog, TemplateConfig::default())
            .run()
            .await
            .unwrap();
        assert_eq!(dialog.messages[0].0, "Error");
        assert!(dialog.messages[0].1.contains("Failed to read batch file"));
        assert_eq!(dialog.messages[1].0, "Terraform");
        assert!(dialog.messages[1].1.contains("debian-base"));
    }

    fn storage_app(dir: &std::path::Path, table: &str) -> App {
        let runner = RecordingRunner::new();
        runner.respond("pvesm status", Output::ok(table));
        tests::app(tests::settings(dir), Arc::new(runner), Options::default())
    }

    const HEADER: &str = "Name  Type  Status  Total  Used  Available  %\n";

    #[tokio::test]
    async fn storage_menu_offers_active_storages() {
        let dir = tempfile::tempdir().unwrap();
        let app = storage_app(
            dir.path(),
            &format!(
                "{}local-lvm lvmthin active 100 20 80 20%\nold-nfs nfs inactive 0 0 0 0%\n",
                HEADER
            ),
        );
        let mut dialog = Scripted::new(vec![Answer::Choice(Some("local-lvm"))]);
        let storage = Menu::new(&app, &mut dialog, TemplateConfig::default())
            .ask_storage("local-lvm")
            .await
            .unwrap();
        assert_eq!(storage.as_deref(), Some("local-lvm"));
    }

    #[tokio::test]
    async fn no_active_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = storage_app(
            dir.path(),
            &format!("{}old-nfs nfs inactive 0 0 0 0%\n", HEADER),
        );
        let mut dialog = Scripted::new(vec![]);
        let err = Menu::new(&app, &mut dialog, TemplateConfig::default())
            .ask_storage("local-lvm")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("old-nfs"));
    }
}
