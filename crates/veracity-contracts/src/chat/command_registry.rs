#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose argument is a record or History reference (id or 1-based index).
pub(crate) const TARGET_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "select",
        action: "select_image",
    },
    CommandSpec {
        command: "load",
        action: "select_history",
    },
];

pub(crate) const OPTIONAL_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "highlight",
    action: "highlight",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "add",
    action: "add_images",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "analyze",
        action: "analyze_batch",
    },
    CommandSpec {
        command: "history",
        action: "show_history",
    },
    CommandSpec {
        command: "clear",
        action: "clear_all",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/add",
    "/analyze",
    "/select",
    "/highlight",
    "/history",
    "/load",
    "/clear",
    "/status",
    "/help",
    "/quit",
];
