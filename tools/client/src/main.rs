// =============================================================================
// PROXIMA — command-line client
// =============================================================================
// Logs in, perturbs and publishes locations, queries nearby users, and runs
// both PSI roles against a live server. The initiator's secret exponent and
// item order live in a local state file between step 1 and step 3; the
// exponent never leaves this machine.
// =============================================================================

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use serde_json::{json, Value};

use proxima_server::geo::haversine_km;
use proxima_server::noise::Noise;
use proxima_server::psi::client::{Initiator, Joiner};
use proxima_server::psi::group;

#[derive(Parser)]
#[command(name = "proxima-client")]
#[command(about = "Client for the Proxima proximity & shared-interest server")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8000")]
    url: String,

    /// User id (token subject)
    #[arg(long)]
    user: String,

    /// Password
    #[arg(long, default_value = "secret")]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Perturb the true coordinate locally, then publish the release point
    Update {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
        /// Privacy budget per release
        #[arg(long, default_value_t = 1.1)]
        epsilon: f64,
        /// Displacement bound in km
        #[arg(long, default_value_t = 3.0)]
        rmax: f64,
        /// Grid snap in degrees
        #[arg(long, default_value_t = 0.0005)]
        grid: f64,
    },
    /// List users within max-distance km of the published point
    Nearby {
        #[arg(long, default_value_t = 6.0)]
        max_distance: f64,
    },
    /// Show the authenticated user
    Me,
    /// PSI step 1: blind an interest set and open a session
    PsiInit {
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// PSI step 2: respond to a session with an interest set
    PsiJoin {
        #[arg(long)]
        session: String,
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// PSI step 3: compute the intersections and report their sizes
    PsiCompute {
        #[arg(long)]
        session: String,
    },
}

struct Api {
    base: String,
    client: reqwest::blocking::Client,
    token: String,
}

impl Api {
    fn login(base: &str, user: &str, password: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::new();
        let resp = client
            .post(format!("{base}/login_for_access_token"))
            .form(&[("username", user), ("password", password)])
            .send()
            .context("login request failed")?;
        let body = read_json(resp)?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("login response carries no access_token"))?
            .to_string();
        Ok(Self { base: base.to_string(), client, token })
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .with_context(|| format!("GET {path} failed"))?;
        read_json(resp)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .with_context(|| format!("POST {path} failed"))?;
        read_json(resp)
    }

    fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .patch(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .with_context(|| format!("PATCH {path} failed"))?;
        read_json(resp)
    }
}

fn read_json(resp: reqwest::blocking::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    Ok(body)
}

fn state_file(session_id: &str) -> String {
    format!("proxima-session-{session_id}.json")
}

fn decode_list(values: &Value) -> Result<Vec<num_bigint::BigUint>> {
    values
        .as_array()
        .ok_or_else(|| anyhow!("expected a value list, got: {values}"))?
        .iter()
        .map(|v| {
            v.as_str()
                .and_then(group::decode_element)
                .ok_or_else(|| anyhow!("bad group element in response: {v}"))
        })
        .collect()
}

fn encode_list(values: &[num_bigint::BigUint]) -> Vec<String> {
    values.iter().map(group::encode_element).collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let api = Api::login(&args.url, &args.user, &args.password)?;

    match args.command {
        Command::Update { lat, lon, epsilon, rmax, grid } => {
            let mechanism = Noise::new(epsilon, rmax, grid);
            let (noisy_lat, noisy_lon) = mechanism.perturb(lat, lon, &mut OsRng);
            println!(
                "release point: {noisy_lat:.4}, {noisy_lon:.4} ({:.2} km from the true point)",
                haversine_km(lat, lon, noisy_lat, noisy_lon)
            );
            api.post(
                "/locations",
                &json!({ "user_id": args.user, "latitude": noisy_lat, "longitude": noisy_lon }),
            )?;
            println!("location published");
        }

        Command::Nearby { max_distance } => {
            let hits = api.get(
                "/locations/nearby_users",
                &[
                    ("user_id", args.user.clone()),
                    ("max_distance", max_distance.to_string()),
                ],
            )?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }

        Command::Me => {
            let me = api.get("/users/me", &[])?;
            println!("{}", serde_json::to_string_pretty(&me)?);
        }

        Command::PsiInit { items } => {
            let initiator = Initiator::new(items.clone(), &mut OsRng);
            let body = api.post(
                "/psi/init",
                &json!({
                    "user_id": args.user,
                    "blinded_values": encode_list(&initiator.blinded_items()),
                }),
            )?;
            let session_id = body["session_id"]
                .as_str()
                .ok_or_else(|| anyhow!("init response carries no session_id"))?;

            let state = json!({
                "session_id": session_id,
                "exponent": group::encode_element(initiator.exponent()),
                "items": items,
            });
            let path = state_file(session_id);
            std::fs::write(&path, serde_json::to_string_pretty(&state)?)
                .with_context(|| format!("writing {path}"))?;
            println!("initiated session {session_id} with {} items", items.len());
            println!("state saved to {path} — run psi-compute after a peer joins");
        }

        Command::PsiJoin { session, items } => {
            let fetched = api.get(&format!("/psi/{session}"), &[])?;
            if fetched["status"] != "INITIATED" {
                bail!("session is {}, expected INITIATED", fetched["status"]);
            }
            let initiator_values = decode_list(&fetched["values"])?;

            let joiner = Joiner::new(items.clone(), &mut OsRng);
            api.post(
                &format!("/psi/{session}/join"),
                &json!({
                    "session_id": session,
                    "user_id": args.user,
                    "response_values": encode_list(&joiner.respond(&initiator_values)),
                }),
            )?;
            println!("joined session {session} with {} items", items.len());
        }

        Command::PsiCompute { session } => {
            let path = state_file(&session);
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("no state file {path}; run psi-init first"))?;
            let state: Value = serde_json::from_str(&raw)?;
            let items: Vec<String> = state["items"]
                .as_array()
                .ok_or_else(|| anyhow!("corrupt state file {path}"))?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let exponent = state["exponent"]
                .as_str()
                .and_then(group::decode_element)
                .ok_or_else(|| anyhow!("corrupt exponent in {path}"))?;
            let initiator = Initiator::from_exponent(items, exponent);

            let fetched = api.get(&format!("/psi/{session}"), &[])?;
            let responses = fetched["values"]
                .as_object()
                .ok_or_else(|| anyhow!("session is {}, no responses yet", fetched["status"]))?;

            for (joiner_id, values) in responses {
                let response_values = decode_list(values)?;
                let shared = initiator.intersect(&response_values)?;
                println!("shared with {joiner_id}: {shared:?} ({} items)", shared.len());

                let patch = api.patch(
                    &format!("/psi/{session}/intersection"),
                    &json!({
                        "user_id": args.user,
                        "other_user_id": joiner_id,
                        "len_intersection": shared.len(),
                    }),
                );
                if let Err(e) = patch {
                    // A second report hits the Completed guard; the first one
                    // already sealed the session.
                    println!("note: could not report size for {joiner_id}: {e}");
                }
            }
        }
    }
    Ok(())
}
