use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::message::{Message, Role};
use super::objectid::create_object_id;
use crate::errors::Result;
use crate::plugins::{HookAction, Plugin};
use crate::providers::base::Provider;
use crate::providers::factory::find_provider;
use crate::settings::Settings;
use crate::tools::Tool;

/// An ordered message history plus the model and provider it is routed to.
///
/// `send` takes `&mut self`, so one conversation never has two sends in flight.
/// Sharing a conversation across threads needs outside synchronization.
pub struct Conversation {
    pub id: String,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    messages: Vec<Message>,
    plugins: Vec<Box<dyn Plugin>>,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("llm_model", &self.llm_model)
            .field("llm_provider", &self.llm_provider)
            .field("messages", &self.messages)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl Conversation {
    /// Create a conversation that reads provider settings from the environment.
    pub fn new(llm_model: Option<&str>, llm_provider: Option<&str>) -> Self {
        Self::with_settings(llm_model, llm_provider, Arc::new(Settings::from_env()))
    }

    pub fn with_settings(
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            id: create_object_id("conv"),
            llm_model: llm_model.map(str::to_string),
            llm_provider: llm_provider.map(str::to_string),
            messages: Vec::new(),
            plugins: Vec::new(),
            settings,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn add_message(
        &mut self,
        role: Role,
        text: impl Into<String>,
        meta: Option<Map<String, Value>>,
    ) {
        let message = Message::new(role, text).with_meta(meta.unwrap_or_default());
        self.messages.push(message);
    }

    /// Insert at the front. The latest call ends up first.
    pub fn prepend_system_message(
        &mut self,
        role: Role,
        text: impl Into<String>,
        meta: Option<Map<String, Value>>,
    ) {
        let message = Message::new(role, text).with_meta(meta.unwrap_or_default());
        self.messages.insert(0, message);
    }

    pub fn add_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Box::new(plugin));
    }

    pub fn get_last_message(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }

    /// Run the plugins, call the provider and append its reply.
    ///
    /// Returns `Ok(None)` when a pre-send hook skipped the vendor call. The
    /// conversation's own provider wins over `llm_provider`, which in turn wins
    /// over the settings default; the model is picked the same way.
    pub fn send(
        &mut self,
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Result<Option<&Message>> {
        self.send_with_tools(&mut [], llm_model, llm_provider)
    }

    pub fn send_with_tools(
        &mut self,
        tools: &mut [Tool],
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Result<Option<&Message>> {
        let provider_name = self
            .llm_provider
            .clone()
            .or_else(|| llm_provider.map(str::to_string))
            .or_else(|| self.settings.default_llm_provider.clone());
        let settings = Arc::clone(&self.settings);

        self.run_send_cycle(llm_model, |conversation, model| {
            let provider = find_provider(provider_name.as_deref(), &settings)?;
            provider.send_conversation(conversation, model, tools)
        })
    }

    /// Same cycle as [`Conversation::send`] against an adapter the caller
    /// already holds.
    pub fn send_with(
        &mut self,
        provider: &dyn Provider,
        tools: &mut [Tool],
        llm_model: Option<&str>,
    ) -> Result<Option<&Message>> {
        self.run_send_cycle(llm_model, |conversation, model| {
            provider.send_conversation(conversation, model, tools)
        })
    }

    fn run_send_cycle<F>(
        &mut self,
        llm_model: Option<&str>,
        dispatch: F,
    ) -> Result<Option<&Message>>
    where
        F: FnOnce(&Conversation, Option<&str>) -> Result<Message>,
    {
        // Hooks get `&mut self`, so the plugin list is moved out while they run.
        let mut plugins = std::mem::take(&mut self.plugins);

        let mut skipped = false;
        for plugin in plugins.iter_mut() {
            if plugin.pre_send_hook(self) == HookAction::Skip {
                skipped = true;
                break;
            }
        }
        if skipped {
            debug!(conversation = %self.id, "send skipped by plugin");
            self.restore_plugins(plugins);
            return Ok(None);
        }

        let model = self.llm_model.clone().or_else(|| llm_model.map(str::to_string));
        let reply = match dispatch(self, model.as_deref()) {
            Ok(reply) => reply,
            Err(err) => {
                self.restore_plugins(plugins);
                return Err(err);
            }
        };

        self.messages.push(Message {
            role: Role::Assistant,
            ..reply
        });
        for plugin in plugins.iter_mut() {
            plugin.post_send_hook(self);
        }
        self.restore_plugins(plugins);

        Ok(self.messages.last())
    }

    fn restore_plugins(&mut self, mut plugins: Vec<Box<dyn Plugin>>) {
        // Plugins added by a hook go after the ones that were already there.
        plugins.append(&mut self.plugins);
        self.plugins = plugins;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SimplemindError;
    use crate::providers::mock::MockProvider;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conversation() -> Conversation {
        Conversation::with_settings(None, Some("openai"), Arc::new(Settings::default()))
    }

    struct SkipPlugin;

    impl Plugin for SkipPlugin {
        fn pre_send_hook(&mut self, conversation: &mut Conversation) -> HookAction {
            conversation.add_message(Role::Assistant, "answered locally", None);
            HookAction::Skip
        }
    }

    struct CountingPlugin {
        pre: Arc<AtomicUsize>,
        post: Arc<AtomicUsize>,
    }

    impl Plugin for CountingPlugin {
        fn pre_send_hook(&mut self, _conversation: &mut Conversation) -> HookAction {
            self.pre.fetch_add(1, Ordering::SeqCst);
            HookAction::Continue
        }

        fn post_send_hook(&mut self, conversation: &Conversation) {
            assert_eq!(
                conversation.messages().last().map(|m| m.role),
                Some(Role::Assistant)
            );
            self.post.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_message_appends() {
        let mut conv = conversation();
        conv.add_message(Role::User, "Hello", None);
        conv.add_message(Role::System, "", None);

        let last = conv.messages().last().unwrap();
        assert_eq!(last.role, Role::System);
        assert_eq!(last.text, "");
        assert_eq!(conv.messages()[0].text, "Hello");
    }

    #[test]
    fn test_prepend_lands_first() {
        let mut conv = conversation();
        conv.add_message(Role::User, "question", None);
        conv.prepend_system_message(Role::System, "first", None);
        conv.prepend_system_message(Role::System, "second", None);

        let texts: Vec<&str> = conv.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "first", "question"]);
    }

    #[test]
    fn test_get_last_message_by_role() {
        let mut conv = conversation();
        conv.add_message(Role::User, "one", None);
        conv.add_message(Role::Assistant, "reply", None);
        conv.add_message(Role::User, "two", None);

        assert_eq!(conv.get_last_message(Role::User).unwrap().text, "two");
        assert_eq!(conv.get_last_message(Role::Assistant).unwrap().text, "reply");
        assert!(conv.get_last_message(Role::System).is_none());
    }

    #[test]
    fn test_send_appends_exactly_one_assistant_message() -> anyhow::Result<()> {
        let provider = MockProvider::new(vec![Ok("Hi there".to_string())]);
        let mut conv = conversation();
        conv.add_message(Role::User, "Hello", None);

        let reply = conv.send_with(&provider, &mut [], None)?.cloned().unwrap();

        assert_eq!(conv.messages().len(), 2);
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text, "Hi there");
        assert_eq!(reply.id, conv.messages()[1].id);
        assert_eq!(reply.llm_model.as_deref(), Some("mock-model"));
        assert_eq!(provider.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_send_appends_nothing() {
        let provider = MockProvider::new(vec![Err(anyhow!("connection reset"))]);
        let mut conv = conversation();
        conv.add_message(Role::User, "Hello", None);

        let err = conv.send_with(&provider, &mut [], None).unwrap_err();

        assert!(matches!(err, SimplemindError::Provider { .. }));
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(conv.messages().len(), 1);
        assert_eq!(conv.messages()[0].role, Role::User);
    }

    #[test]
    fn test_skip_hook_prevents_dispatch() -> anyhow::Result<()> {
        let provider = MockProvider::new(vec![Ok("never".to_string())]);
        let mut conv = conversation();
        conv.add_message(Role::User, "Hello", None);
        conv.add_plugin(SkipPlugin);

        let reply = conv.send_with(&provider, &mut [], None)?;

        assert!(reply.is_none());
        assert_eq!(provider.calls(), 0);
        assert_eq!(
            conv.get_last_message(Role::Assistant).unwrap().text,
            "answered locally"
        );
        Ok(())
    }

    #[test]
    fn test_hooks_run_around_dispatch_and_survive_errors() -> anyhow::Result<()> {
        let pre = Arc::new(AtomicUsize::new(0));
        let post = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider::new(vec![Err(anyhow!("boom")), Ok("ok".to_string())]);

        let mut conv = conversation();
        conv.add_plugin(CountingPlugin {
            pre: Arc::clone(&pre),
            post: Arc::clone(&post),
        });
        conv.add_message(Role::User, "Hello", None);

        assert!(conv.send_with(&provider, &mut [], None).is_err());
        assert_eq!(pre.load(Ordering::SeqCst), 1);
        assert_eq!(post.load(Ordering::SeqCst), 0);

        conv.send_with(&provider, &mut [], None)?;
        assert_eq!(pre.load(Ordering::SeqCst), 2);
        assert_eq!(post.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_pre_hook_mutations_stay_after_failure() {
        let provider = MockProvider::new(vec![Err(anyhow!("unavailable"))]);
        let mut conv = conversation();
        conv.add_message(Role::User, "Hello", None);
        conv.add_plugin(crate::plugins::MemoryPlugin::new(["remember me"]));

        assert!(conv.send_with(&provider, &mut [], None).is_err());
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.messages()[0].text, "remember me");
    }

    #[test]
    fn test_send_without_provider_is_configuration_error() {
        let mut conv = Conversation::with_settings(None, None, Arc::new(Settings::default()));
        conv.add_message(Role::User, "Hello", None);

        let err = conv.send(None, None).unwrap_err();
        assert!(matches!(err, SimplemindError::Configuration(_)));
        assert_eq!(conv.messages().len(), 1);
    }

    #[test]
    fn test_conversation_model_wins_over_override() -> anyhow::Result<()> {
        let provider = MockProvider::new(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let mut conv = Conversation::with_settings(
            Some("pinned"),
            None,
            Arc::new(Settings::default()),
        );

        let first = conv.send_with(&provider, &mut [], Some("other"))?.cloned().unwrap();
        assert_eq!(first.llm_model.as_deref(), Some("pinned"));

        conv.llm_model = None;
        let second = conv.send_with(&provider, &mut [], Some("other"))?.cloned().unwrap();
        assert_eq!(second.llm_model.as_deref(), Some("other"));
        assert_eq!(second.meta.get("mock"), Some(&json!(true)));
        Ok(())
    }
}
