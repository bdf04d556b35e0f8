//! Pizza order workflow.
//!
//! Thread `main` walks the order through its stages:
//!
//! 0. wait for user input, in a loop: `AddToCart`, `ClearCart`, `SubmitCart`,
//!    or the `CartTimeout` timer
//! 1. manager confirms order: `Confirm` also starts thread `payment`, which
//!    waits for `ConfirmPayment`
//! 2. kitchen takes order: `StartCooking`
//! 3. pizzas cooked: `Cooked`
//! 4. taken for delivery: `TakeForDelivery`
//! 5. for delivered: `Delivered`
//! 6. wait for payment, then complete
//!
//! Every stage from 1 to 5 has a timer that ends the order early. Event
//! responses carry the whole order.

use bytes::Bytes;
use durable_core::{
    Advance, AdvanceError, AdvanceInput, CaseSpec, Interpreter, Position, WaitSpec, WorkflowState,
    WorkflowStatus,
};
use durable_runtime::serialization::{Decoder, Encoder, JsonCodec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const WORKFLOW_TYPE: &str = "order";

const MAIN: &str = "main";
const PAYMENT: &str = "payment";

const CART_WAIT: &str = "wait for user input";
const CART_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
const PAYMENT_WAIT: &str = "customer pays money";
const PAYMENT_STEP: usize = 6;

/// One stage of the order that waits for a single event or its timeout.
struct Stage {
    wait: &'static str,
    event: &'static str,
    timer: &'static str,
    delay: Duration,
    /// Order status once the event arrives.
    done: &'static str,
    /// Order status when the timer fires first.
    timed_out: &'static str,
}

/// Stages 1 to 5, in order.
static STAGES: [Stage; 5] = [
    Stage {
        wait: "manager confirms order",
        event: "Confirm",
        timer: "ConfirmTimeout",
        delay: Duration::from_secs(10 * 60),
        done: "confirmed",
        timed_out: "manager is sleeping",
    },
    Stage {
        wait: "kitchen takes order",
        event: "StartCooking",
        timer: "KitchenTimeout",
        delay: Duration::from_secs(30 * 60),
        done: "cooking",
        timed_out: "kitchen is sleeping",
    },
    Stage {
        wait: "pizzas cooked",
        event: "Cooked",
        timer: "CookTimeout",
        delay: Duration::from_secs(3600),
        done: "cooked",
        timed_out: "kitchen cooking is not done",
    },
    Stage {
        wait: "taken for delivery",
        event: "TakeForDelivery",
        timer: "PickupTimeout",
        delay: Duration::from_secs(3600),
        done: "delivering",
        timed_out: "delivery is not done",
    },
    Stage {
        wait: "for delivered",
        event: "Delivered",
        timer: "DeliveryTimeout",
        delay: Duration::from_secs(3600),
        done: "delivered",
        timed_out: "delivery is lost",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pizza {
    pub name: String,
    pub qty: u32,
}

/// Business state of one order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub cart: Vec<Pizza>,
    pub status: String,
    pub paid: bool,
    pub cook_name: String,
}

#[derive(Debug, Deserialize)]
struct CookingRecord {
    cook_name: String,
}

/// Where both threads stand, decoded from the persisted position.
struct Threads {
    main: Position,
    payment: Option<Position>,
}

impl Threads {
    fn from_position(position: &Position) -> Self {
        Self {
            main: position
                .thread(MAIN)
                .cloned()
                .unwrap_or(Position::Loop {
                    index: 0,
                    iteration: 0,
                }),
            payment: position.thread(PAYMENT).cloned(),
        }
    }

    fn into_position(self) -> Position {
        let mut threads = BTreeMap::new();
        threads.insert(MAIN.to_string(), self.main);
        if let Some(payment) = self.payment {
            threads.insert(PAYMENT.to_string(), payment);
        }
        Position::Threads { threads }
    }

    fn step(&self) -> usize {
        self.main.index().unwrap_or_default()
    }
}

/// Accumulates the effects of one advance.
struct Run {
    order: Order,
    threads: Threads,
    armed: Vec<WaitSpec>,
    finished_threads: Vec<String>,
    finished: bool,
}

impl Run {
    /// Park `main` at the wait point of its current step, or complete the
    /// order if it is waiting for a payment that already arrived.
    fn enter(&mut self) {
        match self.threads.step() {
            0 => self.armed.push(WaitSpec::new(
                MAIN,
                CART_WAIT,
                vec![
                    CaseSpec::event("AddToCart"),
                    CaseSpec::event("ClearCart"),
                    CaseSpec::event("SubmitCart"),
                    CaseSpec::timer("CartTimeout", CART_TIMEOUT),
                ],
            )),
            step @ 1..=5 => {
                let stage = &STAGES[step - 1];
                self.armed.push(WaitSpec::new(
                    MAIN,
                    stage.wait,
                    vec![
                        CaseSpec::event(stage.event),
                        CaseSpec::timer(stage.timer, stage.delay),
                    ],
                ));
            }
            _ => self.complete_if_paid(),
        }
    }

    fn complete_if_paid(&mut self) {
        if self.threads.step() == PAYMENT_STEP && self.order.paid {
            self.order.status = "completed".to_string();
            self.finished = true;
        }
    }

    fn next_step(&mut self) {
        self.threads.main = Position::Sequence {
            index: self.threads.step() + 1,
        };
        self.enter();
    }

    fn stop(&mut self, status: &str) {
        self.order.status = status.to_string();
        self.finished = true;
    }

    fn on_main_case(
        &mut self,
        case: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), AdvanceError> {
        let step = self.threads.step();
        if step == 0 {
            let iteration = match self.threads.main {
                Position::Loop { iteration, .. } => iteration,
                _ => 0,
            };
            let again = Position::Loop {
                index: 0,
                iteration: iteration.saturating_add(1),
            };
            match case {
                "AddToCart" => {
                    let pizza: Pizza = parse_payload(case, payload)?;
                    self.order.cart.push(pizza);
                    self.threads.main = again;
                    self.enter();
                }
                "ClearCart" => {
                    self.order.cart.clear();
                    self.threads.main = again;
                    self.enter();
                }
                "SubmitCart" => {
                    self.order.status = "submitted".to_string();
                    self.next_step();
                }
                "CartTimeout" => self.stop("timed out"),
                other => return Err(unexpected(other, step)),
            }
            return Ok(());
        }

        let stage = STAGES
            .get(step.wrapping_sub(1))
            .ok_or_else(|| unexpected(case, step))?;
        if case == stage.timer {
            self.stop(stage.timed_out);
        } else if case == stage.event {
            if case == "StartCooking" {
                let record: CookingRecord = parse_payload(case, payload)?;
                self.order.cook_name = record.cook_name;
            }
            if case == "Confirm" {
                self.threads.payment = Some(Position::start());
                self.armed.push(WaitSpec::new(
                    PAYMENT,
                    PAYMENT_WAIT,
                    vec![CaseSpec::event("ConfirmPayment")],
                ));
            }
            self.order.status = stage.done.to_string();
            self.next_step();
        } else {
            return Err(unexpected(case, step));
        }
        Ok(())
    }

    fn on_payment(&mut self) {
        self.order.paid = true;
        self.threads.payment = None;
        self.finished_threads.push(PAYMENT.to_string());
        self.complete_if_paid();
    }
}

fn parse_payload<T>(case: &str, payload: Option<serde_json::Value>) -> Result<T, AdvanceError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(payload.unwrap_or(serde_json::Value::Null))
        .map_err(|e| AdvanceError::Rejected(format!("invalid {} payload: {}", case, e)))
}

fn unexpected(case: &str, step: usize) -> AdvanceError {
    AdvanceError::Rejected(format!("'{}' does not apply at step {}", case, step))
}

/// Interpreter for the `order` workflow type.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderInterpreter;

impl Interpreter for OrderInterpreter {
    fn initial_position(&self) -> Position {
        Threads::from_position(&Position::start()).into_position()
    }

    fn advance(&self, state: &WorkflowState, input: AdvanceInput) -> Result<Advance, AdvanceError> {
        let decoded: anyhow::Result<Option<Order>> = JsonCodec.decode(state.data_bytes());
        let order =
            decoded.map_err(|e| AdvanceError::Business(format!("corrupt order state: {:#}", e)))?;

        let mut run = Run {
            order: order.unwrap_or_default(),
            threads: Threads::from_position(&state.position),
            armed: Vec::new(),
            finished_threads: Vec::new(),
            finished: false,
        };

        let resolved = match input {
            AdvanceInput::Resume => {
                if state.waits.get(MAIN).is_none() {
                    run.enter();
                }
                None
            }
            AdvanceInput::Event {
                thread,
                case,
                payload,
            } => {
                if thread == PAYMENT && case == "ConfirmPayment" {
                    run.on_payment();
                } else {
                    run.on_main_case(&case, Some(payload))?;
                }
                Some(case)
            }
            AdvanceInput::Timer { case, .. } => {
                run.on_main_case(&case, None)?;
                Some(case)
            }
        };

        let output = resolved
            .as_ref()
            .map(|_| serde_json::to_value(&run.order))
            .transpose()
            .map_err(|e| AdvanceError::Transient(e.into()))?;
        let data: Bytes = JsonCodec
            .encode(&run.order)
            .map_err(AdvanceError::Transient)?;

        let status = if run.finished {
            tracing::info!(order_status = %run.order.status, "Order finished");
            WorkflowStatus::Finished
        } else {
            WorkflowStatus::Waiting
        };

        let mut advance = Advance::new(data, run.threads.into_position(), status);
        advance.armed = run.armed;
        advance.finished_threads = run.finished_threads;
        advance.resolved = resolved;
        advance.output = output;
        Ok(advance)
    }
}
