use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fleetd",
    about = "Pooled tmux windows, idle reclamation and title sync for agent missions",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon until interrupted
    Run,

    /// Create a mission and print its id
    New {
        /// Git repository the mission works on
        repo: String,

        /// Recurring trigger this mission belongs to
        #[arg(long)]
        cron_id: Option<String>,

        /// Display name of the recurring trigger
        #[arg(long)]
        cron_name: Option<String>,
    },

    /// List missions
    List {
        /// Include archived missions
        #[arg(long)]
        all: bool,
    },

    /// Resolve a short id to the full mission id
    Resolve {
        /// Full id or short-id prefix
        prefix: String,
    },

    /// Show a mission in a tmux session, starting it if needed
    Attach {
        /// Mission id or short-id prefix
        id: String,

        /// tmux session to link the mission into (defaults to pool.default_view)
        #[arg(long)]
        view: Option<String>,
    },

    /// Remove a mission from a tmux session; it keeps running
    Detach {
        /// Mission id or short-id prefix
        id: String,

        /// tmux session to unlink from (defaults to pool.default_view)
        #[arg(long)]
        view: Option<String>,
    },

    /// Stop a mission's process and destroy its window
    Stop {
        /// Mission id or short-id prefix
        id: String,
    },

    /// Stop a mission and hide it from listings
    Archive {
        /// Mission id or short-id prefix
        id: String,
    },

    /// Record that a mission is alive
    Heartbeat {
        /// Mission id or short-id prefix
        id: String,

        /// The user interacted with it (also records last-active and counts a prompt)
        #[arg(long)]
        active: bool,

        /// Process id of the agent wrapper
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Re-apply a mission's window title now
    Retitle {
        /// Mission id or short-id prefix
        id: String,
    },

    /// Synchronize one configured repository now
    UpdateRepo {
        /// Repository name from [[repos]]
        name: String,

        /// Also refresh the remote default branch
        #[arg(long)]
        default_branch: bool,

        /// Run the post-update hook even if nothing changed
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },
}
