//! SubscriberActor - one worker per subscription.
//!
//! Each subscription gets its own mailbox, so a handler sees its events in
//! publish order while different handlers run concurrently. Handler errors
//! and panics are caught here and never stop the worker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::Event;

use super::actor::BusCounters;
use super::handler::{panic_message, HandlerRef};
use super::SubscriptionId;

#[derive(Debug)]
pub enum SubscriberMsg {
    Deliver(Arc<Event>),
    /// Replies once every earlier delivery has been handled.
    Flush(RpcReplyPort<()>),
}

pub struct SubscriberArguments {
    pub id: SubscriptionId,
    pub handler: HandlerRef,
    pub counters: Arc<BusCounters>,
}

pub struct SubscriberState {
    id: SubscriptionId,
    handler: HandlerRef,
    counters: Arc<BusCounters>,
}

#[derive(Debug, Default)]
pub struct SubscriberActor;

#[async_trait]
impl Actor for SubscriberActor {
    type Msg = SubscriberMsg;
    type State = SubscriberState;
    type Arguments = SubscriberArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            subscription = %args.id,
            handler = %args.handler.name(),
            "Subscriber worker starting"
        );
        Ok(SubscriberState {
            id: args.id,
            handler: args.handler,
            counters: args.counters,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SubscriberMsg::Deliver(event) => deliver(state, event).await,
            SubscriberMsg::Flush(reply) => {
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            subscription = %state.id,
            "Subscriber worker stopped"
        );
        Ok(())
    }
}

async fn deliver(state: &SubscriberState, event: Arc<Event>) {
    let event_type = event.event_type;
    let fut = state.handler.0.handle(event);

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => state.counters.record_delivered(),
        Ok(Err(e)) => {
            state.counters.record_handler_failure();
            tracing::error!(
                subscription = %state.id,
                handler = %state.handler.name(),
                event_type = %event_type,
                error = %e,
                "Event handler failed"
            );
        }
        Err(panic_err) => {
            state.counters.record_handler_failure();
            tracing::error!(
                subscription = %state.id,
                handler = %state.handler.name(),
                event_type = %event_type,
                panic = %panic_message(panic_err.as_ref()),
                "Event handler panicked"
            );
        }
    }
}
