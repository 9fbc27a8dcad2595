use crate::config::Config;
use crate::event::{EventHandler, SyncEvent};
use crate::remote::{Filters, HttpClient, Item, RemoteClient};
use crate::sync::{EntitySnapshot, ListSnapshot, Surface, SyncError, SyncFacade, ORDERS, PRODUCTS};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::debug;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// List products, optionally filtered (e.g. `brand=Acme size=L`)
  Products {
    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: u32,
    filters: Vec<String>,
  },
  /// List placed orders
  Orders {
    #[arg(long, default_value_t = 1)]
    pages: u32,
  },
  /// Show the cart with totals
  Cart,
  /// Add one of a product to the cart
  Add { id: String },
  /// Remove one of a product from the cart
  Decrease { id: String },
  /// Set the quantity of a cart line
  Set {
    id: String,
    quantity: u32,
    /// Edit as from the product detail page
    #[arg(long)]
    detail: bool,
  },
  /// Remove a product from the cart
  Remove { id: String },
  /// Validate stock and place an order
  Checkout { address_id: String },
  /// Fetch products by id and show their sync state
  Entity {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Read commands from stdin, keeping lists and edits between them
  Shell,
}

/// One line typed into the shell
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
  #[command(subcommand)]
  command: ShellCommand,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
  #[command(flatten)]
  Run(Command),
  /// Load the next page of a list already shown
  More {
    resource: String,
    filters: Vec<String>,
  },
  /// Show a list as cached, without fetching
  Show {
    resource: String,
    filters: Vec<String>,
  },
  /// Forget a cached list
  Reset {
    resource: String,
    filters: Vec<String>,
  },
  /// Send pending writes and leave
  Quit,
}

/// Runs one command against the sync layer
pub struct App<C: RemoteClient> {
  facade: SyncFacade<C>,
  events: EventHandler,
}

impl App<HttpClient> {
  pub fn new(config: &Config) -> Result<Self> {
    let client = HttpClient::new(&config.backend)?;
    Ok(Self::with_client(Arc::new(client), config))
  }
}

impl<C: RemoteClient> App<C> {
  pub fn with_client(client: Arc<C>, config: &Config) -> Self {
    let events = EventHandler::new();
    let facade = SyncFacade::new(
      client,
      config.sync.debounce_windows(),
      config.pricing,
      events.sender(),
    );
    Self { facade, events }
  }

  pub async fn run(&mut self, command: Command, out: &mut impl Write) -> Result<()> {
    let result = match command {
      Command::Shell => self.shell(BufReader::new(tokio::io::stdin()), out).await,
      command => self.dispatch(command, out).await,
    };

    // Nothing may be left unsent when the process exits
    self.facade.flush().await;
    self.report_events(out)?;

    result
  }

  async fn dispatch(&mut self, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
      Command::Products { pages, filters } => {
        self.print_list(&parse_filters(PRODUCTS, &filters), pages, out).await
      }
      Command::Orders { pages } => self.print_list(&Filters::new(ORDERS), pages, out).await,
      Command::Cart => {
        self.facade.refresh_cart().await?;
        self.print_cart(out)
      }
      Command::Add { id } => {
        self.facade.refresh_cart().await?;
        self.facade.increase(&id);
        self.settle_and_print(out).await
      }
      Command::Decrease { id } => {
        self.facade.refresh_cart().await?;
        if self.facade.decrease(&id).is_none() {
          return Err(eyre!("{} is not in the cart", id));
        }
        self.settle_and_print(out).await
      }
      Command::Set {
        id,
        quantity,
        detail,
      } => {
        self.facade.refresh_cart().await?;
        if detail {
          self.facade.set_quantity_on(Surface::Detail, &id, quantity);
        } else {
          self.facade.set_quantity(&id, quantity);
        }
        self.settle_and_print(out).await
      }
      Command::Remove { id } => {
        self.facade.refresh_cart().await?;
        self.facade.remove(&id);
        self.settle_and_print(out).await
      }
      Command::Checkout { address_id } => {
        self.facade.refresh_cart().await?;
        self.checkout(&address_id, out).await
      }
      Command::Entity { ids } => {
        self.facade.refresh_entities(&ids).await;
        for id in &ids {
          match self.facade.observe_entity(id) {
            Some(snapshot) => print_entity(&snapshot, out)?,
            None => writeln!(out, "{:<24} not available", id)?,
          }
        }
        Ok(())
      }
      Command::Shell => Err(eyre!("already in the shell")),
    }
  }

  /// Run commands line by line until `quit` or end of input
  pub async fn shell<R>(&mut self, input: R, out: &mut impl Write) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
      let words: Vec<&str> = line.split_whitespace().collect();
      if words.is_empty() {
        continue;
      }

      let command = match ShellLine::try_parse_from(words) {
        Ok(parsed) => parsed.command,
        Err(e) => {
          writeln!(out, "{}", e)?;
          continue;
        }
      };

      let result = match command {
        ShellCommand::Quit => break,
        ShellCommand::Run(command) => self.dispatch(command, out).await,
        ShellCommand::More { resource, filters } => {
          self.more(&parse_filters(&resource, &filters), out).await
        }
        ShellCommand::Show { resource, filters } => {
          self.show(&parse_filters(&resource, &filters), out)
        }
        ShellCommand::Reset { resource, filters } => {
          let filters = parse_filters(&resource, &filters);
          self.facade.reset(&self.facade.key_for(&filters));
          writeln!(out, "forgot {}", filters.resource).map_err(Into::into)
        }
      };
      if let Err(e) = result {
        writeln!(out, "error: {}", e)?;
      }
      self.report_events(out)?;
    }
    Ok(())
  }

  async fn more(&mut self, filters: &Filters, out: &mut impl Write) -> Result<()> {
    let key = self.facade.key_for(filters);
    if self.facade.observe(&key).is_none() {
      return self.print_list(filters, 1, out).await;
    }
    if self.facade.is_fetching(&key) {
      writeln!(out, "still loading, try again")?;
      return Ok(());
    }
    if !self.facade.has_more(&key) {
      writeln!(out, "no more pages")?;
      return Ok(());
    }
    match self.facade.load_next_page(&key).await? {
      Some(snapshot) => print_snapshot(&snapshot, out),
      None => Ok(()),
    }
  }

  fn show(&self, filters: &Filters, out: &mut impl Write) -> Result<()> {
    match self.facade.observe(&self.facade.key_for(filters)) {
      Some(snapshot) => print_snapshot(&snapshot, out),
      None => {
        writeln!(out, "{} not loaded", filters.resource)?;
        Ok(())
      }
    }
  }

  async fn settle_and_print(&mut self, out: &mut impl Write) -> Result<()> {
    self.facade.flush().await;
    self.print_cart(out)
  }

  async fn checkout(&mut self, address_id: &str, out: &mut impl Write) -> Result<()> {
    match self.facade.commit_checkout(address_id).await {
      Ok(receipt) => {
        writeln!(
          out,
          "Order {} placed: {:.2}, {} lines checked ({})",
          receipt.order.order_id,
          receipt.order.total_amount,
          receipt.reconciliation.canonical_items.len(),
          receipt.order.placed_at.format("%Y-%m-%d %H:%M")
        )?;
        if (receipt.order.total_amount - receipt.totals.total).abs() >= 0.005 {
          writeln!(out, "local total was {:.2}", receipt.totals.total)?;
        }
        Ok(())
      }
      Err(SyncError::StockConflict(result)) => {
        for id in &result.out_of_stock {
          writeln!(out, "out of stock: {}", id)?;
        }
        for id in &result.over_quantity {
          writeln!(out, "not enough stock: {}", id)?;
        }
        writeln!(out)?;
        self.print_cart(out)?;
        Err(eyre!("checkout refused, the cart changed on the server"))
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn print_list(&mut self, filters: &Filters, pages: u32, out: &mut impl Write) -> Result<()> {
    let mut snapshot = self.facade.fetch_page(filters, 1).await?;
    for _ in 1..pages {
      if !self.facade.has_more(&snapshot.key) {
        break;
      }
      match self.facade.load_next_page(&snapshot.key).await? {
        Some(next) => snapshot = next,
        None => break,
      }
    }
    print_snapshot(&snapshot, out)
  }

  fn print_cart(&self, out: &mut impl Write) -> Result<()> {
    let items = self.facade.cart_items();
    if items.is_empty() {
      writeln!(out, "Cart is empty")?;
      return Ok(());
    }

    for item in &items {
      print_item(item, out)?;
    }
    let totals = self.facade.totals();
    writeln!(out, "{:<24} {:>22.2}", "subtotal", totals.subtotal)?;
    writeln!(out, "{:<24} {:>22.2}", "discount", -totals.discount)?;
    writeln!(out, "{:<24} {:>22.2}", "delivery", totals.delivery_fee)?;
    writeln!(out, "{:<24} {:>22.2}", "total", totals.total)?;
    Ok(())
  }

  /// Log queued sync events and surface failed writes to the user
  fn report_events(&mut self, out: &mut impl Write) -> Result<()> {
    for event in self.events.drain() {
      match event {
        SyncEvent::WriteFailed { entity_id, error } => {
          writeln!(out, "write for {} failed and was rolled back: {}", entity_id, error)?;
        }
        SyncEvent::EntityChanged(snapshot) => debug!(
          entity = %snapshot.item.id,
          quantity = snapshot.item.quantity,
          phase = snapshot.phase.label(),
          "entity changed"
        ),
        SyncEvent::ListChanged(snapshot) => {
          debug!(key = %snapshot.key, items = snapshot.items.len(), "list changed")
        }
        SyncEvent::FetchDiscarded { key, reason } => {
          debug!(key = %key, reason = %reason, "page discarded")
        }
        SyncEvent::ListInvalidated { key, tag } => {
          debug!(key = %key, tag = %tag, "list invalidated")
        }
      }
    }
    Ok(())
  }
}

fn parse_filters(resource: &str, pairs: &[String]) -> Filters {
  Filters::parse_pairs(resource, pairs.iter().map(String::as_str))
}

fn print_snapshot(snapshot: &ListSnapshot, out: &mut impl Write) -> Result<()> {
  writeln!(out, "{} ({})", snapshot.description, snapshot.key)?;
  for item in &snapshot.items {
    print_item(item, out)?;
  }
  let pagination = &snapshot.pagination;
  write!(out, "page {}/{}", pagination.current_page, pagination.total_pages)?;
  if pagination.has_next {
    write!(out, ", more available")?;
  }
  if let Some(at) = snapshot.fetched_at {
    write!(out, ", fetched {}", at.format("%H:%M:%S"))?;
  }
  if snapshot.fetching {
    write!(out, ", updating")?;
  }
  writeln!(out)?;
  Ok(())
}

fn print_entity(snapshot: &EntitySnapshot, out: &mut impl Write) -> Result<()> {
  write!(
    out,
    "{:<24} {:>4} confirmed {:<4} {:<11} write {:?}",
    snapshot.item.id,
    snapshot.item.quantity,
    snapshot.confirmed,
    snapshot.phase.label(),
    snapshot.write
  )?;
  if let Some(error) = &snapshot.last_error {
    write!(out, ", last error: {}", error)?;
  }
  writeln!(out)?;
  Ok(())
}

fn print_item(item: &Item, out: &mut impl Write) -> Result<()> {
  writeln!(
    out,
    "{:<24} {:>4} {:>6} {:>10.2}",
    item.id, item.quantity, item.stock, item.price
  )?;
  Ok(())
}
